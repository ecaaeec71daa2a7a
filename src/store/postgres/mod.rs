pub use builder::*;
pub use event_store::*;
pub use statements::Statements;

mod builder;
mod event_store;
mod statements;
