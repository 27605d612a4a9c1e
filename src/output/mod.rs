pub mod formatters;
pub mod report;

pub use formatters::{formatter_for, ConsoleFormatter, JsonFormatter, ReadingFormatter};
pub use report::HealthReport;
