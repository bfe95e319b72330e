//! Response size estimation and budget enforcement.
//!
//! Sizes are estimated as one token per four bytes of compact JSON. Pages
//! over budget are halved until they fit; a page that still does not fit
//! at one item has its long strings clipped and long arrays cut. Single
//! objects over budget keep their small fields and have the largest ones
//! replaced by summaries. Neither path fails: data that was valid but too
//! large is returned shrunk and marked, with guidance on how to ask for less.

use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::pagination::Page;

/// Upper bound on page halvings before falling back to clipping.
const MAX_HALVINGS: u32 = 10;

/// Clip length tried first when items must be truncated.
const INITIAL_CLIP_CHARS: usize = 4096;

/// Strings are never clipped below this.
const MIN_CLIP_CHARS: usize = 64;

/// Arrays inside clipped items keep at most this many elements.
const MAX_ARRAY_ITEMS: usize = 50;

/// Keys listed in the summary of an omitted object.
const SUMMARY_KEYS: usize = 200;

/// Estimated token count of `value` rendered as compact JSON.
pub fn estimate_tokens<T: Serialize + ?Sized>(value: &T) -> usize {
    serde_json::to_string(value).map_or(0, |s| s.len().div_ceil(4))
}

#[derive(Debug, Clone, Copy)]
pub struct SizeGuard {
    max_tokens: usize,
}

impl SizeGuard {
    pub fn new(max_tokens: usize) -> Self {
        Self {
            max_tokens: max_tokens.max(1),
        }
    }

    pub const fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    fn fits<T: Serialize + ?Sized>(&self, value: &T) -> bool {
        estimate_tokens(value) <= self.max_tokens
    }

    /// Shrink `page` until it fits the budget.
    pub fn fit_page(&self, mut page: Page<Value>) -> Page<Value> {
        if self.fits(&page) {
            return page;
        }

        let original_len = page.items.len();
        let mut halvings = 0;
        while page.items.len() > 1 && halvings < MAX_HALVINGS && !self.fits(&page) {
            let keep = (page.items.len() / 2).max(1);
            page.items.truncate(keep);
            halvings += 1;
        }
        debug!(
            original = original_len,
            kept = page.items.len(),
            halvings,
            "Halved page to fit response budget"
        );

        if !self.fits(&page) {
            let pristine = page.items.clone();
            let mut clip = INITIAL_CLIP_CHARS;
            loop {
                page.items = pristine.iter().map(|item| clip_value(item, clip)).collect();
                if self.fits(&page) || clip <= MIN_CLIP_CHARS {
                    break;
                }
                clip = (clip / 2).max(MIN_CLIP_CHARS);
            }
            page.pagination.truncated = Some(true);
            if !self.fits(&page) {
                warn!(
                    tokens = estimate_tokens(&page),
                    budget = self.max_tokens,
                    "Page still over budget after clipping"
                );
            }
        }

        let returned = page.items.len();
        if returned < original_len {
            let next_offset = page.window.start + returned;
            page.pagination.returned_count = Some(returned);
            page.pagination.next_offset = Some(next_offset);
            page.pagination.has_next = next_offset < page.pagination.total_count;
        }
        page
    }

    /// Fit a single object, summarizing its largest fields if needed.
    ///
    /// `guidance` tells the caller how to request a smaller answer.
    pub fn fit_object(&self, value: Value, guidance: &str) -> Value {
        if self.fits(&value) {
            return value;
        }
        let original_tokens = estimate_tokens(&value);

        let mut map = match value {
            Value::Object(map) => map,
            other => return self.clip_to_budget(&other, original_tokens, guidance),
        };

        let mut by_size: Vec<(String, usize)> = map
            .iter()
            .map(|(key, field)| (key.clone(), estimate_tokens(field)))
            .collect();
        by_size.sort_by(|a, b| b.1.cmp(&a.1));

        let mut truncated_fields = Vec::new();
        for (key, _) in by_size {
            if self.fits(&with_marker(&map, &truncated_fields, original_tokens, guidance)) {
                break;
            }
            if let Some(field) = map.get_mut(&key) {
                *field = summarize(field);
                truncated_fields.push(key);
            }
        }

        let result = with_marker(&map, &truncated_fields, original_tokens, guidance);
        if self.fits(&result) {
            debug!(fields = ?truncated_fields, "Summarized object fields to fit response budget");
            return result;
        }
        self.clip_to_budget(&Value::Object(map), original_tokens, guidance)
    }

    /// Last resort: clip every string and array until the value fits.
    fn clip_to_budget(&self, value: &Value, original_tokens: usize, guidance: &str) -> Value {
        let mut clip = INITIAL_CLIP_CHARS;
        loop {
            let clipped = json!({
                "value": clip_value(value, clip),
                "truncated": true,
                "original_tokens": original_tokens,
                "guidance": guidance,
            });
            if self.fits(&clipped) || clip <= MIN_CLIP_CHARS {
                return clipped;
            }
            clip = (clip / 2).max(MIN_CLIP_CHARS);
        }
    }
}

fn with_marker(
    map: &Map<String, Value>,
    truncated_fields: &[String],
    original_tokens: usize,
    guidance: &str,
) -> Value {
    let mut out = map.clone();
    if !truncated_fields.is_empty() {
        out.insert("truncated".into(), Value::Bool(true));
        out.insert("truncated_fields".into(), json!(truncated_fields));
        out.insert("original_tokens".into(), json!(original_tokens));
        out.insert("guidance".into(), json!(guidance));
    }
    Value::Object(out)
}

/// Compact stand-in for an omitted field.
fn summarize(value: &Value) -> Value {
    match value {
        Value::Object(map) => json!({
            "omitted": true,
            "key_count": map.len(),
            "keys": map.keys().take(SUMMARY_KEYS).collect::<Vec<_>>(),
            "estimated_tokens": estimate_tokens(value),
        }),
        Value::Array(items) => json!({
            "omitted": true,
            "item_count": items.len(),
            "estimated_tokens": estimate_tokens(value),
        }),
        Value::String(s) => Value::String(clip_str(s, 256)),
        other => other.clone(),
    }
}

/// Copy of `value` with strings clipped to `max_chars` and arrays cut.
fn clip_value(value: &Value, max_chars: usize) -> Value {
    match value {
        Value::String(s) => Value::String(clip_str(s, max_chars)),
        Value::Array(items) => {
            let mut out: Vec<Value> = items
                .iter()
                .take(MAX_ARRAY_ITEMS)
                .map(|item| clip_value(item, max_chars))
                .collect();
            if items.len() > MAX_ARRAY_ITEMS {
                out.push(Value::String(format!(
                    "…[{} more items truncated]",
                    items.len() - MAX_ARRAY_ITEMS
                )));
            }
            Value::Array(out)
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), clip_value(v, max_chars)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn clip_str(s: &str, max_chars: usize) -> String {
    let total = s.chars().count();
    if total <= max_chars {
        return s.to_string();
    }
    let kept: String = s.chars().take(max_chars).collect();
    format!("{kept}…[truncated {} chars]", total - max_chars)
}
