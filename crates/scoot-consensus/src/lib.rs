pub mod acceptor;
pub mod proposer;
pub mod recovery;
pub mod rpc;

pub use acceptor::{Acceptor, Promise};
pub use proposer::{Decision, Proposer};
