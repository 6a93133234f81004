pub mod rewrite;
pub mod topology;
