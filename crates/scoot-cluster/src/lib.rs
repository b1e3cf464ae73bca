pub mod membership;

pub use membership::{Member, Membership};
