pub mod build;
pub mod convert;
pub mod merge;
