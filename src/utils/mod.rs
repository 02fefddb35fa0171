pub mod dataset;
pub mod merge;
pub mod multipart;
