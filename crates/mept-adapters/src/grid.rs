use async_trait::async_trait;
use mept_core::RawListing;
use scraper::{ElementRef, Html, Selector};

use crate::{non_blank, AdapterError, PageFormat, StoreAdapter};

/// Ordered CSS selector lists. Within each list the first selector that
/// yields an acceptable value wins.
#[derive(Debug, Clone)]
pub struct SelectorCascade {
    pub cards: Vec<String>,
    pub names: Vec<String>,
    pub prices: Vec<String>,
    pub images: Vec<String>,
    pub links: Vec<String>,
    pub max_cards: usize,
    /// Names must be strictly longer than this many characters.
    pub min_name_chars: usize,
}

impl Default for SelectorCascade {
    fn default() -> Self {
        let owned = |list: &[&str]| list.iter().map(|s| s.to_string()).collect();
        Self {
            cards: owned(&[
                ".product-item",
                ".product",
                ".item.product",
                "[data-product-id]",
                ".grid-item",
                ".card",
            ]),
            names: owned(&[
                ".product-name",
                "h2",
                "h3",
                ".name",
                "a",
                "[class*=\"title\"]",
                "[class*=\"name\"]",
            ]),
            prices: owned(&[".price", ".special-price", "[class*=\"price\"]", ".current-price"]),
            images: owned(&["img"]),
            links: owned(&["a[href]"]),
            max_cards: 50,
            min_name_chars: 3,
        }
    }
}

#[derive(Debug, Clone)]
struct CompiledCascade {
    cards: Vec<Selector>,
    names: Vec<Selector>,
    prices: Vec<Selector>,
    images: Vec<Selector>,
    links: Vec<Selector>,
    max_cards: usize,
    min_name_chars: usize,
}

fn compile(list: &[String]) -> Result<Vec<Selector>, AdapterError> {
    list.iter()
        .map(|s| {
            Selector::parse(s).map_err(|e| AdapterError::Selector {
                selector: s.clone(),
                reason: e.to_string(),
            })
        })
        .collect()
}

/// Scrapes product cards out of a store's category grid page.
#[derive(Debug, Clone)]
pub struct HtmlGridAdapter {
    store_name: String,
    store_slug: String,
    base_url: String,
    cascade: CompiledCascade,
}

impl HtmlGridAdapter {
    pub fn new(
        store_name: impl Into<String>,
        store_slug: impl Into<String>,
        base_url: impl Into<String>,
        cascade: SelectorCascade,
    ) -> Result<Self, AdapterError> {
        Ok(Self {
            store_name: store_name.into(),
            store_slug: store_slug.into(),
            base_url: base_url.into(),
            cascade: CompiledCascade {
                cards: compile(&cascade.cards)?,
                names: compile(&cascade.names)?,
                prices: compile(&cascade.prices)?,
                images: compile(&cascade.images)?,
                links: compile(&cascade.links)?,
                max_cards: cascade.max_cards,
                min_name_chars: cascade.min_name_chars,
            },
        })
    }

    fn card_to_raw(&self, card: ElementRef<'_>) -> RawListing {
        let c = &self.cascade;
        let name = first_text(card, &c.names, |t| t.chars().count() > c.min_name_chars);
        let price = first_text(card, &c.prices, |t| {
            t.contains('€') || t.chars().any(|ch| ch.is_ascii_digit())
        });
        let link = first_attr(card, &c.links, &["href"]).or_else(|| {
            card.value()
                .attr("href")
                .and_then(non_blank)
        });
        let image = first_attr(card, &c.images, &["src", "data-src"]);

        RawListing {
            store_name: Some(self.store_name.clone()),
            raw_name: name,
            raw_price_text: price,
            url: link.map(|l| absolutize_url(&self.base_url, &l)),
            image_url: image.map(|i| absolutize_url(&self.base_url, &i)),
        }
    }
}

fn first_text(card: ElementRef<'_>, selectors: &[Selector], accept: impl Fn(&str) -> bool) -> Option<String> {
    selectors.iter().find_map(|sel| {
        card.select(sel)
            .next()
            .and_then(|n| non_blank(&n.text().collect::<String>()))
            .filter(|t| accept(t))
    })
}

fn first_attr(card: ElementRef<'_>, selectors: &[Selector], attrs: &[&str]) -> Option<String> {
    selectors.iter().find_map(|sel| {
        card.select(sel).find_map(|n| {
            attrs
                .iter()
                .find_map(|attr| n.value().attr(attr).and_then(non_blank))
        })
    })
}

/// `//cdn/x.jpg` → `https://cdn/x.jpg`, `/p/1` → `<base>/p/1`, absolute urls unchanged.
pub fn absolutize_url(base_url: &str, href: &str) -> String {
    if href.starts_with("//") {
        format!("https:{href}")
    } else if href.starts_with('/') {
        format!("{}{href}", base_url.trim_end_matches('/'))
    } else if href.starts_with("http://") || href.starts_with("https://") || href.starts_with("data:") {
        href.to_string()
    } else {
        format!("{}/{href}", base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl StoreAdapter for HtmlGridAdapter {
    fn store_name(&self) -> &str {
        &self.store_name
    }

    fn store_slug(&self) -> &str {
        &self.store_slug
    }

    fn format(&self) -> PageFormat {
        PageFormat::Html
    }

    fn parse_category_page(&self, _page_url: &str, body: &str) -> Result<Vec<RawListing>, AdapterError> {
        let document = Html::parse_document(body);
        let Some(card_selector) = self
            .cascade
            .cards
            .iter()
            .find(|sel| document.select(sel).next().is_some())
        else {
            return Ok(Vec::new());
        };
        Ok(document
            .select(card_selector)
            .take(self.cascade.max_cards)
            .map(|card| self.card_to_raw(card))
            .collect())
    }
}
