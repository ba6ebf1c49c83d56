//! # Contract Sources
//!
//! The well-known ledger programs: the escrow contract body, its
//! redemption clause, and the standard pay-to-pubkey program used for
//! plain spendable outputs. Parties identify contract instances by seed —
//! the hash of the source — so these strings are consensus constants;
//! reformatting them is a hard fork.

use once_cell::sync::Lazy;

use tessera_protocol::types::Hash32;

use crate::anchor::contract_seed;

/// The escrow contract. Phase 1 runs in the buyer's propose-payment
/// transaction: it takes the escrowed payment and the commitments,
/// time-checks the reveal window, writes the commitment log entries, and
/// outputs the phase-2 contract. Phase 2 runs in the seller's reveal-key
/// transaction: it merges the collateral, logs the post-merge anchor, the
/// key, the seller, and the resulting output id, and outputs the
/// redemption contract.
pub const ESCROW_SOURCE: &str = r#"# tessera escrow, phase 1: propose
get get get get get get                  # revealms refundms buyer cipherroot clearroot payment
5 roll dup 0 swap timerange              # reveal window starts now
log                                      # {'R', seed, 0, revealms}
4 roll log                               # {'L', seed, refundms}
3 roll dup log                           # {'L', seed, buyer}
2 roll log                               # {'L', seed, cipherroot}
1 roll log                               # {'L', seed, clearroot}
dup amount log                           # {'L', seed, amount}
dup assetid log                          # {'L', seed, assetid}
dup anchor log                           # {'L', seed, anchor1}
[                                        # phase 2: reveal
    get get get                          # seller key collateral
    2 roll merge                         # escrow = payment + collateral
    dup anchor log                       # {'L', seed, anchor2}
    1 roll dup log                       # {'L', seed, key}
    2 roll dup log                       # {'L', seed, seller}
    [ redeem ] output                    # {'L', seed, outputid} via output
] wrap output                            # await seller or expiry
"#;

/// The redemption clause carried by the escrow output. Selector `0` is the
/// seller's claim after the refund deadline; selector `1` is the buyer's
/// refund with a fraud proof before it.
pub const REDEMPTION_SOURCE: &str = r#"# tessera escrow redemption
get                                      # selector
dup 0 eq jumpif:$claim
drop
# clause 1: refund before the deadline with a fraud proof
get get get get get                      # index cipherchunk clearhash clearproof cipherproof
5 roll refundms before verify
4 roll dup 6 roll key decryptchunk       # plaintext under the revealed key
indexhash                                # clear hash of the decrypted chunk
5 roll dup 2 roll eq not verify          # committed hash must disagree
4 roll clearroot checkproof verify       # clear hash is committed at index
3 roll cipherroot checkproof verify      # cipher chunk is committed at index
buyer put call                           # pay 2*amount to the buyer
finalize
jump:$end
$claim
# clause 0: claim payment after the refund window closes
drop
refundms after verify
seller put call                          # pay 2*amount to the seller
finalize
$end
"#;

/// Standard single-key spendable output: checks one Ed25519 signature over
/// the spending transaction, then releases the value and defers the
/// caller-supplied predicate.
pub const PAY_TO_PUBKEY_SOURCE: &str = r#"# standard pay-to-pubkey
get get                                  # sigprog sig
1 roll dup 2 roll                        # arrange for checksig
anchor cat checksig verify               # sig covers sigprog || anchor
put put yield                            # release value, defer sigprog
"#;

/// Seed of the escrow contract — the marker observers scan the log for.
pub static ESCROW_SEED: Lazy<Hash32> = Lazy::new(|| contract_seed(ESCROW_SOURCE));

/// Seed of the standard pay-to-pubkey program.
pub static PAY_TO_PUBKEY_SEED: Lazy<Hash32> = Lazy::new(|| contract_seed(PAY_TO_PUBKEY_SOURCE));
