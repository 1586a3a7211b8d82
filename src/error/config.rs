use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid request increase rate '{value}'. Use 'N' or 'N/duration'.")]
    InvalidIncreaseRateFormat { value: String },
    #[error("Invalid request increase step in '{value}': {source}")]
    InvalidIncreaseStep {
        value: String,
        #[source]
        source: std::num::ParseIntError,
    },
    #[error("Invalid request increase interval in '{value}': {source}")]
    InvalidIncreaseInterval {
        value: String,
        #[source]
        source: Box<ConfigError>,
    },
    #[error("Duration must not be empty.")]
    DurationEmpty,
    #[error("Invalid duration '{value}'.")]
    InvalidDurationFormat { value: String },
    #[error("Invalid duration '{value}': {source}")]
    InvalidDurationNumber {
        value: String,
        #[source]
        source: std::num::ParseIntError,
    },
    #[error("Duration overflow.")]
    DurationOverflow,
    #[error("Invalid duration unit '{unit}'.")]
    InvalidDurationUnit { unit: String },
    #[error("Duration must be > 0.")]
    DurationZero,
    #[cfg(test)]
    #[error("Test expectation failed: {message}")]
    TestExpectation { message: &'static str },
    #[cfg(test)]
    #[error("Test expectation failed: {message}: {value}")]
    TestExpectationValue {
        message: &'static str,
        value: String,
    },
}
