/// Same delay between every attempt.
pub mod fixed;

/// Delay growing geometrically from a base up to a cap.
pub mod exponential;
