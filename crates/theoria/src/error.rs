use std::fmt;

use thiserror::Error;

/// The write that a read-only type refused.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Violation {
    SetAttribute(String),
    UnsetAttribute(String),
    SetRelation(String),
    Call(String),
}

impl Violation {
    /// Name of the refused operation (`set`, `unset`, `setRelation` or the method name).
    pub fn operation(&self) -> &str {
        match self {
            Violation::SetAttribute(_) => "set",
            Violation::UnsetAttribute(_) => "unset",
            Violation::SetRelation(_) => "setRelation",
            Violation::Call(method) => method,
        }
    }

    /// Attribute or relation the operation targeted, when there is one.
    pub fn subject(&self) -> Option<&str> {
        match self {
            Violation::SetAttribute(name)
            | Violation::UnsetAttribute(name)
            | Violation::SetRelation(name) => Some(name),
            Violation::Call(_) => None,
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::SetAttribute(name) => write!(f, "Cannot set attribute [{name}]"),
            Violation::UnsetAttribute(name) => write!(f, "Cannot unset attribute [{name}]"),
            Violation::SetRelation(name) => write!(f, "Cannot set relation [{name}]"),
            Violation::Call(method) => write!(f, "Cannot call [{method}]"),
        }
    }
}

#[derive(Debug, Error)]
pub enum TheoriaError {
    #[error("{violation}")]
    Violation { model: String, violation: Violation },
    #[error("configuration error: {message}")]
    Configuration { message: String },
    #[error("No query results for model [{model}] {ids}")]
    NotFound { model: String, ids: String },
    #[error("relation [{relation}] is not loaded on model [{model}]")]
    RelationNotLoaded { model: String, relation: String },
    #[error("call to undefined relationship [{relation}] on model [{model}]")]
    UndefinedRelation { model: String, relation: String },
    #[error("validation error: {message}")]
    Validation { message: String },
    #[error("storage error: {message}")]
    Storage { message: String },
    #[error(transparent)]
    Database(#[from] sea_orm::DbErr),
}

impl TheoriaError {
    pub fn cannot_call(model: impl Into<String>, method: impl Into<String>) -> Self {
        Self::Violation {
            model: model.into(),
            violation: Violation::Call(method.into()),
        }
    }

    pub fn cannot_set_attribute(model: impl Into<String>, key: impl Into<String>) -> Self {
        Self::Violation {
            model: model.into(),
            violation: Violation::SetAttribute(key.into()),
        }
    }

    pub fn cannot_unset_attribute(model: impl Into<String>, key: impl Into<String>) -> Self {
        Self::Violation {
            model: model.into(),
            violation: Violation::UnsetAttribute(key.into()),
        }
    }

    pub fn cannot_set_relation(model: impl Into<String>, relation: impl Into<String>) -> Self {
        Self::Violation {
            model: model.into(),
            violation: Violation::SetRelation(relation.into()),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn not_found(model: impl Into<String>, ids: impl Into<String>) -> Self {
        Self::NotFound {
            model: model.into(),
            ids: ids.into(),
        }
    }

    pub fn relation_not_loaded(model: impl Into<String>, relation: impl Into<String>) -> Self {
        Self::RelationNotLoaded {
            model: model.into(),
            relation: relation.into(),
        }
    }

    pub fn undefined_relation(model: impl Into<String>, relation: impl Into<String>) -> Self {
        Self::UndefinedRelation {
            model: model.into(),
            relation: relation.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    pub fn is_violation(&self) -> bool {
        matches!(self, Self::Violation { .. })
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// The refused write, when this error is a violation.
    pub fn violation(&self) -> Option<&Violation> {
        match self {
            Self::Violation { violation, .. } => Some(violation),
            _ => None,
        }
    }
}

pub type TheoriaResult<T> = Result<T, TheoriaError>;
