use std::error::Error;
use std::fmt::{Display, Formatter};

pub type SepResult<T> = Result<T, SeparationError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SeparationErrorCategory {
    /// Deterministic problem with the inputs; never retried.
    Configuration,
    /// Numerical failure of one patch, reported with diagnostic context.
    Numerical,
    Internal,
}

impl SeparationErrorCategory {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Configuration => "ConfigurationError",
            Self::Numerical => "NumericalError",
            Self::Internal => "InternalError",
        }
    }

    pub const fn severity(self) -> &'static str {
        match self {
            Self::Configuration | Self::Numerical => "ERROR",
            Self::Internal => "FATAL",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeparationError {
    category: SeparationErrorCategory,
    code: &'static str,
    message: String,
}

impl SeparationError {
    pub fn new(
        category: SeparationErrorCategory,
        code: &'static str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code,
            message: message.into(),
        }
    }

    pub fn configuration(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(SeparationErrorCategory::Configuration, code, message)
    }

    pub fn numerical(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(SeparationErrorCategory::Numerical, code, message)
    }

    pub fn internal(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(SeparationErrorCategory::Internal, code, message)
    }

    pub const fn category(&self) -> SeparationErrorCategory {
        self.category
    }

    pub const fn code(&self) -> &'static str {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub const fn is_configuration(&self) -> bool {
        matches!(self.category, SeparationErrorCategory::Configuration)
    }

    pub const fn is_numerical(&self) -> bool {
        matches!(self.category, SeparationErrorCategory::Numerical)
    }

    pub fn diagnostic_line(&self) -> String {
        format!(
            "{}: [{}] {}",
            self.category.severity(),
            self.code,
            self.message
        )
    }
}

impl Display for SeparationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} [{}] {}",
            self.category.as_str(),
            self.code,
            self.message
        )
    }
}

impl Error for SeparationError {}
