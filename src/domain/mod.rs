pub mod records;
pub mod series;

pub use records::*;
pub use series::*;
