pub mod batch;
pub mod catalog;
pub mod error;
pub mod logging;
pub mod retrieval;
pub mod source;
pub mod time_axis;
pub mod transform;
pub mod writer;
