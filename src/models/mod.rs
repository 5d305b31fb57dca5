pub mod identity;
pub mod metadata;
pub mod query;

pub use identity::*;
pub use metadata::*;
pub use query::*;
