use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ParseEnumError, Phase};

/// Lifecycle status of a product listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductStatus {
    Uploading,
    Processing,
    Paused,
    Completed,
    Error,
    Published,
}

impl ProductStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ProductStatus::Uploading => "uploading",
            ProductStatus::Processing => "processing",
            ProductStatus::Paused => "paused",
            ProductStatus::Completed => "completed",
            ProductStatus::Error => "error",
            ProductStatus::Published => "published",
        }
    }

    /// Whether the pipeline has finished with this product, successfully or not.
    pub fn is_settled(self) -> bool {
        matches!(
            self,
            ProductStatus::Completed | ProductStatus::Published | ProductStatus::Error
        )
    }
}

impl FromStr for ProductStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uploading" => Ok(ProductStatus::Uploading),
            "processing" => Ok(ProductStatus::Processing),
            "paused" => Ok(ProductStatus::Paused),
            "completed" => Ok(ProductStatus::Completed),
            "error" => Ok(ProductStatus::Error),
            "published" => Ok(ProductStatus::Published),
            other => Err(ParseEnumError::new("product status", other)),
        }
    }
}

text_enum_sql!(ProductStatus);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    pub current_phase: Phase,
    pub status: ProductStatus,
    pub is_pipeline_running: bool,
    pub requires_manual_review: bool,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Product {
    /// A freshly uploaded product sitting before phase 1.
    pub fn new(id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            current_phase: Phase::FIRST,
            status: ProductStatus::Uploading,
            is_pipeline_running: false,
            requires_manual_review: false,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A status write against a product row.
///
/// Flags left as `None` keep their stored value. `expected` turns the write
/// into a compare-and-swap on the current status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductStatusChange {
    pub status: ProductStatus,
    pub expected: Option<Vec<ProductStatus>>,
    pub is_pipeline_running: Option<bool>,
    pub requires_manual_review: Option<bool>,
    /// `Some(None)` clears the stored message.
    pub error_message: Option<Option<String>>,
}

impl ProductStatusChange {
    pub fn to(status: ProductStatus) -> Self {
        Self {
            status,
            expected: None,
            is_pipeline_running: None,
            requires_manual_review: None,
            error_message: None,
        }
    }

    pub fn only_from(mut self, expected: &[ProductStatus]) -> Self {
        self.expected = Some(expected.to_vec());
        self
    }

    pub fn running(mut self, running: bool) -> Self {
        self.is_pipeline_running = Some(running);
        self
    }

    pub fn manual_review(mut self, required: bool) -> Self {
        self.requires_manual_review = Some(required);
        self
    }

    pub fn error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(Some(message.into()));
        self
    }

    pub fn clear_error(mut self) -> Self {
        self.error_message = Some(None);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_product_status_parse() {
        for status in [
            ProductStatus::Uploading,
            ProductStatus::Processing,
            ProductStatus::Paused,
            ProductStatus::Completed,
            ProductStatus::Error,
            ProductStatus::Published,
        ] {
            assert_eq!(status.as_str().parse::<ProductStatus>().unwrap(), status);
        }
        assert!("done".parse::<ProductStatus>().is_err());
    }

    #[test]
    fn test_new_product_defaults() {
        let product = Product::new("p-1", Utc::now());
        assert_eq!(product.status, ProductStatus::Uploading);
        assert_eq!(product.current_phase, Phase::Recognition);
        assert!(!product.is_pipeline_running);
        assert!(!product.requires_manual_review);
    }

    #[test]
    fn test_status_change_builder() {
        let change = ProductStatusChange::to(ProductStatus::Error)
            .only_from(&[ProductStatus::Processing])
            .running(false)
            .manual_review(true)
            .error("boom");
        assert_eq!(change.expected, Some(vec![ProductStatus::Processing]));
        assert_eq!(change.is_pipeline_running, Some(false));
        assert_eq!(change.requires_manual_review, Some(true));
        assert_eq!(change.error_message, Some(Some("boom".to_string())));
    }
}
