//! # Ledger Log Layout
//!
//! A transaction's execution log is the contract's public record. The
//! propose phase contributes one `'R'`-tagged timerange entry followed by
//! seven `'L'` data entries, all tagged with the escrow seed; the reveal
//! phase contributes four more `'L'` entries. The layout is positional —
//! [`scan_log`] reads fixed offsets from the `'R'` marker, and the buyer's
//! input signature programs check the same offsets, so builder, verifier,
//! and parser must agree on every position.
//!
//! [`expected_propose_log`] and [`expected_reveal_log`] are that agreement
//! written down once: they predict the exact log a well-formed transaction
//! emits. The signature-program generator derives its peek positions from
//! them, and the parse/build bijection tests hold `scan_log` against them.

use tessera_protocol::types::{Hash32, LogValue, ParsedTransfer, RevealData};

use crate::script::{ESCROW_SEED, PAY_TO_PUBKEY_SEED};

/// Log entry markers.
pub mod marker {
    /// A spent input.
    pub const INPUT: &[u8] = b"I";
    /// A created output.
    pub const OUTPUT: &[u8] = b"O";
    /// A logged data value.
    pub const LOG: &[u8] = b"L";
    /// A time range check.
    pub const TIMERANGE: &[u8] = b"R";
}

// ---------------------------------------------------------------------------
// Scanning
// ---------------------------------------------------------------------------

/// Scans a transaction log for a call into the escrow contract.
///
/// Looks for the `{'R', seed, 0, reveal_deadline}` marker, then reads the
/// seven following `'L'` entries for the propose-phase commitments. If a
/// later `'L'` run tagged with the escrow seed exists, its four entries
/// fill the reveal-phase data. Returns `None` when the marker is missing
/// or any positional entry has the wrong shape.
pub fn scan_log(log: &[LogValue]) -> Option<ParsedTransfer> {
    for (i, entry) in log.iter().enumerate() {
        let LogValue::Tuple(items) = entry else {
            continue;
        };
        if items.len() != 4
            || items[0].as_bytes() != Some(marker::TIMERANGE)
            || items[1].as_bytes() != Some(ESCROW_SEED.as_slice())
        {
            continue;
        }

        let reveal_deadline_ms = u64::try_from(items[3].as_int()?).ok()?;
        let mut parsed = ParsedTransfer {
            reveal_deadline_ms,
            refund_deadline_ms: u64::try_from(data_entry(log, i + 1)?.as_int()?).ok()?,
            buyer: data_entry(log, i + 2)?.as_hash32()?,
            cipher_root: data_entry(log, i + 3)?.as_hash32()?,
            clear_root: data_entry(log, i + 4)?.as_hash32()?,
            amount: u64::try_from(data_entry(log, i + 5)?.as_int()?).ok()?,
            asset_id: data_entry(log, i + 6)?.as_hash32()?,
            anchor1: data_entry(log, i + 7)?.as_hash32()?,
            reveal: None,
        };

        for j in i + 8..log.len() {
            if data_entry(log, j).is_some() {
                parsed.reveal = Some(RevealData {
                    anchor2: data_entry(log, j)?.as_hash32()?,
                    key: data_entry(log, j + 1)?.as_hash32()?,
                    seller: data_entry(log, j + 2)?.as_hash32()?,
                    output_id: data_entry(log, j + 3)?.as_hash32()?,
                });
                break;
            }
        }
        return Some(parsed);
    }
    None
}

/// The payload of an `{'L', escrow_seed, value}` entry at `index`, if the
/// entry exists and has that exact shape.
fn data_entry(log: &[LogValue], index: usize) -> Option<&LogValue> {
    let LogValue::Tuple(items) = log.get(index)? else {
        return None;
    };
    if items.len() == 3
        && items[0].as_bytes() == Some(marker::LOG)
        && items[1].as_bytes() == Some(ESCROW_SEED.as_slice())
    {
        Some(&items[2])
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// Prediction
// ---------------------------------------------------------------------------

/// A change output produced by a spend: `(amount, anchor, output_id)`.
pub type ChangeRecord = (u64, Hash32, Hash32);

/// Entries contributed by spending a party's reserved inputs: two per
/// input, plus the change run (`'L'`, `'L'`, `'O'` — output last) when
/// change exists.
fn spend_entries(
    owner: &Hash32,
    input_anchors: &[Hash32],
    change: Option<&ChangeRecord>,
) -> Vec<LogValue> {
    let seed = PAY_TO_PUBKEY_SEED.as_slice();
    let mut entries = Vec::new();
    for anchor in input_anchors {
        entries.push(LogValue::Tuple(vec![
            LogValue::bytes(marker::INPUT),
            LogValue::bytes(seed),
            LogValue::bytes(anchor),
        ]));
        entries.push(LogValue::Tuple(vec![
            LogValue::bytes(marker::LOG),
            LogValue::bytes(seed),
            LogValue::bytes(owner),
        ]));
    }
    if let Some((amount, anchor, output_id)) = change {
        entries.push(LogValue::Tuple(vec![
            LogValue::bytes(marker::LOG),
            LogValue::bytes(seed),
            LogValue::Int(*amount as i64),
        ]));
        entries.push(LogValue::Tuple(vec![
            LogValue::bytes(marker::LOG),
            LogValue::bytes(seed),
            LogValue::bytes(anchor),
        ]));
        entries.push(LogValue::Tuple(vec![
            LogValue::bytes(marker::OUTPUT),
            LogValue::bytes(seed),
            LogValue::bytes(output_id),
        ]));
    }
    entries
}

/// Escrow-tagged entries contributed by the propose phase, in log order.
fn escrow_propose_entries(parsed: &ParsedTransfer) -> Vec<LogValue> {
    let seed = ESCROW_SEED.as_slice();
    let mut entries = vec![LogValue::Tuple(vec![
        LogValue::bytes(marker::TIMERANGE),
        LogValue::bytes(seed),
        LogValue::Int(0),
        LogValue::Int(parsed.reveal_deadline_ms as i64),
    ])];
    let data = [
        LogValue::Int(parsed.refund_deadline_ms as i64),
        LogValue::bytes(parsed.buyer),
        LogValue::bytes(parsed.cipher_root),
        LogValue::bytes(parsed.clear_root),
        LogValue::Int(parsed.amount as i64),
        LogValue::bytes(parsed.asset_id),
        LogValue::bytes(parsed.anchor1),
    ];
    entries.extend(data.into_iter().map(|value| {
        LogValue::Tuple(vec![
            LogValue::bytes(marker::LOG),
            LogValue::bytes(seed),
            value,
        ])
    }));
    entries
}

/// Predicts the full log of a propose-payment transaction.
pub fn expected_propose_log(
    parsed: &ParsedTransfer,
    input_anchors: &[Hash32],
    change: Option<&ChangeRecord>,
) -> Vec<LogValue> {
    let mut log = spend_entries(&parsed.buyer, input_anchors, change);
    log.extend(escrow_propose_entries(parsed));
    log
}

/// Predicts the full log of a completed (propose + reveal) transaction.
/// `parsed.reveal` must be present.
pub fn expected_reveal_log(
    parsed: &ParsedTransfer,
    propose_input_anchors: &[Hash32],
    propose_change: Option<&ChangeRecord>,
    collateral_input_anchors: &[Hash32],
    collateral_change: Option<&ChangeRecord>,
) -> Vec<LogValue> {
    let reveal = parsed
        .reveal
        .as_ref()
        .expect("reveal data required to predict a reveal log");

    let mut log = expected_propose_log(parsed, propose_input_anchors, propose_change);
    log.extend(spend_entries(
        &reveal.seller,
        collateral_input_anchors,
        collateral_change,
    ));

    let seed = ESCROW_SEED.as_slice();
    for value in [
        LogValue::bytes(reveal.anchor2),
        LogValue::bytes(reveal.key),
        LogValue::bytes(reveal.seller),
        LogValue::bytes(reveal.output_id),
    ] {
        log.push(LogValue::Tuple(vec![
            LogValue::bytes(marker::LOG),
            LogValue::bytes(seed),
            value,
        ]));
    }
    log
}

/// Position of the `'R'` marker in a propose log: two entries per input,
/// plus three for the change run. The signature programs peek from here.
pub fn escrow_log_position(input_count: usize, has_change: bool) -> usize {
    2 * input_count + if has_change { 3 } else { 0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_parsed(reveal: Option<RevealData>) -> ParsedTransfer {
        ParsedTransfer {
            reveal_deadline_ms: 10_000,
            refund_deadline_ms: 20_000,
            buyer: [0xb1; 32],
            cipher_root: [0xc1; 32],
            clear_root: [0xc2; 32],
            amount: 100,
            asset_id: [0xa5; 32],
            anchor1: [0x11; 32],
            reveal,
        }
    }

    fn sample_reveal() -> RevealData {
        RevealData {
            anchor2: [0x22; 32],
            key: [0x33; 32],
            seller: [0x44; 32],
            output_id: [0x55; 32],
        }
    }

    #[test]
    fn scan_inverts_expected_propose_log() {
        let parsed = sample_parsed(None);
        let change = (37, [0x77; 32], [0x88; 32]);
        let log = expected_propose_log(&parsed, &[[0x01; 32], [0x02; 32]], Some(&change));
        assert_eq!(scan_log(&log), Some(parsed));
    }

    #[test]
    fn scan_inverts_expected_propose_log_without_change() {
        let parsed = sample_parsed(None);
        let log = expected_propose_log(&parsed, &[[0x01; 32]], None);
        assert_eq!(scan_log(&log), Some(parsed));
    }

    #[test]
    fn scan_inverts_expected_reveal_log() {
        let parsed = sample_parsed(Some(sample_reveal()));
        let log = expected_reveal_log(
            &parsed,
            &[[0x01; 32], [0x02; 32]],
            Some(&(37, [0x77; 32], [0x88; 32])),
            &[[0x03; 32]],
            None,
        );
        assert_eq!(scan_log(&log), Some(parsed));
    }

    #[test]
    fn escrow_marker_position_matches_prediction() {
        let parsed = sample_parsed(None);
        for (inputs, change) in [(1usize, None), (2, Some((37, [0x77; 32], [0x88; 32]))), (3, None)]
        {
            let anchors: Vec<Hash32> = (0..inputs).map(|i| [i as u8 + 1; 32]).collect();
            let log = expected_propose_log(&parsed, &anchors, change.as_ref());
            let pos = escrow_log_position(inputs, change.is_some());
            let LogValue::Tuple(items) = &log[pos] else {
                panic!("expected tuple at escrow position");
            };
            assert_eq!(items[0].as_bytes(), Some(marker::TIMERANGE));
        }
    }

    #[test]
    fn scan_returns_none_without_escrow_marker() {
        // A log full of unrelated entries, including a 4-tuple with the
        // wrong seed.
        let log = vec![
            LogValue::Tuple(vec![
                LogValue::bytes(marker::INPUT),
                LogValue::bytes([0x01; 32]),
                LogValue::bytes([0x02; 32]),
            ]),
            LogValue::Tuple(vec![
                LogValue::bytes(marker::TIMERANGE),
                LogValue::bytes([0x09; 32]),
                LogValue::Int(0),
                LogValue::Int(99),
            ]),
        ];
        assert_eq!(scan_log(&log), None);
    }

    #[test]
    fn scan_rejects_malformed_positional_entry() {
        let parsed = sample_parsed(None);
        let mut log = expected_propose_log(&parsed, &[[0x01; 32]], None);
        // Truncate the buyer entry (R is at position 2 here, buyer at 4).
        log[4] = LogValue::Int(0);
        assert_eq!(scan_log(&log), None);
    }

    #[test]
    fn partial_transaction_has_no_reveal_data() {
        let parsed = sample_parsed(None);
        let log = expected_propose_log(&parsed, &[[0x01; 32]], None);
        let scanned = scan_log(&log).unwrap();
        assert!(scanned.reveal.is_none());
    }
}
