#[macro_use]
extern crate serde;

mod blind;
mod codec;
mod credentials;
mod encryption;
mod error;
mod relay;
mod token;
mod transaction;
mod vote;

pub use blind::*;
pub use codec::*;
pub use credentials::*;
pub use encryption::*;
pub use error::*;
pub use relay::*;
pub use token::*;
pub use transaction::*;
pub use vote::*;
