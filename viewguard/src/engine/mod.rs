pub mod analyzer;
pub mod dispatcher;
