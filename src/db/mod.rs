pub mod dialect;
pub mod schema;
pub mod store;

pub use dialect::*;
pub use schema::*;
pub use store::*;
