use std::fmt;

#[derive(Debug)]
pub enum SlideGuardError {
    InvalidConfiguration(String),
    FontRegistration(String),
    DocumentOpen(String),
    Render(String),
    Write(std::io::Error),
    Io(std::io::Error),
}

impl fmt::Display for SlideGuardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlideGuardError::InvalidConfiguration(message) => {
                write!(f, "invalid configuration: {}", message)
            }
            SlideGuardError::FontRegistration(message) => {
                write!(f, "font registration failed: {}", message)
            }
            SlideGuardError::DocumentOpen(message) => {
                write!(f, "cannot open document: {}", message)
            }
            SlideGuardError::Render(message) => write!(f, "render error: {}", message),
            SlideGuardError::Write(err) => write!(f, "cannot write output: {}", err),
            SlideGuardError::Io(err) => write!(f, "io error: {}", err),
        }
    }
}

impl std::error::Error for SlideGuardError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SlideGuardError::Write(err) | SlideGuardError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for SlideGuardError {
    fn from(value: std::io::Error) -> Self {
        SlideGuardError::Io(value)
    }
}

impl From<lopdf::Error> for SlideGuardError {
    fn from(value: lopdf::Error) -> Self {
        SlideGuardError::DocumentOpen(value.to_string())
    }
}
