use async_trait::async_trait;
use mept_core::RawListing;
use serde_json::Value as JsonValue;

use crate::{absolutize_url, non_blank, AdapterError, PageFormat, StoreAdapter};

/// Stores that expose their catalogue as JSON: either a bare array of
/// products or an object with a `products` array.
#[derive(Debug, Clone)]
pub struct JsonFeedAdapter {
    store_name: String,
    store_slug: String,
    base_url: String,
}

impl JsonFeedAdapter {
    pub fn new(
        store_name: impl Into<String>,
        store_slug: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            store_name: store_name.into(),
            store_slug: store_slug.into(),
            base_url: base_url.into(),
        }
    }

    fn item_to_raw(&self, item: &JsonValue) -> RawListing {
        RawListing {
            store_name: Some(self.store_name.clone()),
            raw_name: json_text(item, &["name", "title"]),
            raw_price_text: json_text(item, &["price", "priceText", "special_price"]),
            url: json_text(item, &["url", "link"]).map(|u| absolutize_url(&self.base_url, &u)),
            image_url: json_text(item, &["image", "imageUrl", "image_url"])
                .map(|u| absolutize_url(&self.base_url, &u)),
        }
    }
}

/// First key holding a non-blank string or a number.
fn json_text(item: &JsonValue, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match item.get(*key)? {
        JsonValue::String(s) => non_blank(s),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

#[async_trait]
impl StoreAdapter for JsonFeedAdapter {
    fn store_name(&self) -> &str {
        &self.store_name
    }

    fn store_slug(&self) -> &str {
        &self.store_slug
    }

    fn format(&self) -> PageFormat {
        PageFormat::Json
    }

    fn parse_category_page(&self, _page_url: &str, body: &str) -> Result<Vec<RawListing>, AdapterError> {
        let value: JsonValue =
            serde_json::from_str(body).map_err(|e| AdapterError::InvalidFeed(e.to_string()))?;
        let items = match &value {
            JsonValue::Array(items) => items,
            JsonValue::Object(map) => match map.get("products") {
                Some(JsonValue::Array(items)) => items,
                _ => return Err(AdapterError::InvalidFeed("object without a products array".into())),
            },
            _ => return Err(AdapterError::InvalidFeed("expected an array of products".into())),
        };
        Ok(items
            .iter()
            .filter(|item| item.is_object())
            .map(|item| self.item_to_raw(item))
            .collect())
    }
}
