#[macro_use]
extern crate num_derive;

pub mod client;
pub mod mbuf;
pub mod protocol;
pub mod server;
pub mod util;
