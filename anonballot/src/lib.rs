#[macro_use]
extern crate serde;

mod audit;
mod authn;
mod ballot;
mod bulletin;
mod credential;
mod custody;
mod decryption;
mod election;
mod error;
mod guard;
mod issuance;
mod keygen;
mod maintenance;
mod paillier;
mod record;
mod secret_share;
mod serde_hex;
mod store;
mod tally;
mod trustee;
mod util;
mod vote;

pub mod merkle;

pub use audit::*;
pub use authn::*;
pub use ballot::*;
pub use bulletin::*;
pub use credential::*;
pub use custody::*;
pub use decryption::*;
pub use election::*;
pub use error::*;
pub use guard::*;
pub use issuance::*;
pub use keygen::*;
pub use maintenance::*;
pub use paillier::*;
pub use record::*;
pub use secret_share::*;
pub use serde_hex::*;
pub use store::*;
pub use tally::*;
pub use trustee::*;
pub use util::*;
pub use vote::*;
