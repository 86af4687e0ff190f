pub mod operations;
pub mod events;
pub mod searcher;
pub mod errors;

pub use operations::*;
pub use events::*;
pub use searcher::*;
pub use errors::*;
