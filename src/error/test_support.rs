use super::{ClientError, ConfigError};

impl From<&'static str> for ConfigError {
    fn from(message: &'static str) -> Self {
        ConfigError::TestExpectation { message }
    }
}

impl From<String> for ConfigError {
    fn from(value: String) -> Self {
        ConfigError::TestExpectationValue {
            message: "Test expectation failed",
            value,
        }
    }
}

impl From<&'static str> for ClientError {
    fn from(message: &'static str) -> Self {
        ClientError::TestExpectation { message }
    }
}

impl From<String> for ClientError {
    fn from(value: String) -> Self {
        ClientError::TestExpectationValue {
            message: "Test expectation failed",
            value,
        }
    }
}
