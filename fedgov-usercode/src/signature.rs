use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "kind", content = "name")]
pub enum ReturnAnnotation {
    Empty,
    Named(String),
    /// The string keyed mapping every wrapper returns.
    StructuredMapping,
}

impl fmt::Display for ReturnAnnotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReturnAnnotation::Empty => Ok(()),
            ReturnAnnotation::Named(name) => f.write_str(name),
            ReturnAnnotation::StructuredMapping => f.write_str("Dict[str, Any]"),
        }
    }
}

/// Declared call shape of a submitted function.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub parameters: Vec<String>,
    pub return_annotation: ReturnAnnotation,
}

impl Signature {
    pub fn new(parameters: Vec<String>, returns: Option<String>) -> Self {
        Self {
            parameters,
            return_annotation: returns.map_or(ReturnAnnotation::Empty, ReturnAnnotation::Named),
        }
    }

    pub fn with_return_annotation(mut self, annotation: ReturnAnnotation) -> Self {
        self.return_annotation = annotation;
        self
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({})", self.parameters.join(", "))?;
        if self.return_annotation != ReturnAnnotation::Empty {
            write!(f, " -> {}", self.return_annotation)?;
        }
        Ok(())
    }
}
