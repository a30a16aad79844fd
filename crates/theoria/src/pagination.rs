use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};

use crate::{TheoriaError, TheoriaResult, Value};

const POINTS_TO_NEXT: &str = "_pointsToNextItems";

/// Page of results with the total row count.
#[derive(Clone, Debug, Serialize)]
pub struct LengthAwarePage<C> {
    current_page: u64,
    data: C,
    from: Option<u64>,
    last_page: u64,
    per_page: u64,
    to: Option<u64>,
    total: u64,
}

impl<C> LengthAwarePage<C> {
    pub(crate) fn new(items: C, count: usize, total: u64, per_page: u64, page: u64) -> Self {
        let (from, to) = page_bounds(count, per_page, page);
        Self {
            current_page: page,
            data: items,
            from,
            last_page: total.div_ceil(per_page).max(1),
            per_page,
            to,
            total,
        }
    }

    pub fn items(&self) -> &C {
        &self.data
    }

    pub fn into_items(self) -> C {
        self.data
    }

    pub fn map_items<D>(self, map: impl FnOnce(C) -> D) -> LengthAwarePage<D> {
        LengthAwarePage {
            current_page: self.current_page,
            data: map(self.data),
            from: self.from,
            last_page: self.last_page,
            per_page: self.per_page,
            to: self.to,
            total: self.total,
        }
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn per_page(&self) -> u64 {
        self.per_page
    }

    pub fn current_page(&self) -> u64 {
        self.current_page
    }

    pub fn last_page(&self) -> u64 {
        self.last_page
    }

    /// 1-based position of the first item on this page.
    pub fn first_item(&self) -> Option<u64> {
        self.from
    }

    pub fn last_item(&self) -> Option<u64> {
        self.to
    }

    pub fn has_more_pages(&self) -> bool {
        self.current_page < self.last_page
    }

    pub fn on_first_page(&self) -> bool {
        self.current_page <= 1
    }
}

/// Page of results without a count; only knows whether another page follows.
#[derive(Clone, Debug, Serialize)]
pub struct SimplePage<C> {
    current_page: u64,
    data: C,
    from: Option<u64>,
    per_page: u64,
    to: Option<u64>,
    #[serde(skip)]
    has_more: bool,
}

impl<C> SimplePage<C> {
    pub(crate) fn new(items: C, count: usize, per_page: u64, page: u64, has_more: bool) -> Self {
        let (from, to) = page_bounds(count, per_page, page);
        Self {
            current_page: page,
            data: items,
            from,
            per_page,
            to,
            has_more,
        }
    }

    pub fn items(&self) -> &C {
        &self.data
    }

    pub fn into_items(self) -> C {
        self.data
    }

    pub fn per_page(&self) -> u64 {
        self.per_page
    }

    pub fn current_page(&self) -> u64 {
        self.current_page
    }

    pub fn first_item(&self) -> Option<u64> {
        self.from
    }

    pub fn last_item(&self) -> Option<u64> {
        self.to
    }

    pub fn has_more_pages(&self) -> bool {
        self.has_more
    }

    pub fn on_first_page(&self) -> bool {
        self.current_page <= 1
    }
}

fn page_bounds(count: usize, per_page: u64, page: u64) -> (Option<u64>, Option<u64>) {
    if count == 0 {
        return (None, None);
    }
    let from = page
        .saturating_sub(1)
        .saturating_mul(per_page)
        .saturating_add(1);
    (Some(from), Some(from.saturating_add(count as u64 - 1)))
}

/// Position in a keyset-paginated result: the order column values of a boundary row.
#[derive(Clone, Debug, PartialEq)]
pub struct Cursor {
    parameters: IndexMap<String, Value>,
    points_to_next_items: bool,
}

impl Cursor {
    pub fn new(parameters: IndexMap<String, Value>, points_to_next_items: bool) -> Self {
        Self {
            parameters,
            points_to_next_items,
        }
    }

    pub fn parameter(&self, column: &str) -> Value {
        self.parameters.get(column).cloned().unwrap_or(Value::Null)
    }

    pub fn parameters(&self) -> &IndexMap<String, Value> {
        &self.parameters
    }

    pub fn points_to_next_items(&self) -> bool {
        self.points_to_next_items
    }

    pub fn points_to_previous_items(&self) -> bool {
        !self.points_to_next_items
    }

    /// URL-safe base64 of the JSON parameters.
    pub fn encode(&self) -> String {
        let mut object = Map::new();
        for (column, value) in &self.parameters {
            object.insert(column.clone(), value.to_json());
        }
        object.insert(
            POINTS_TO_NEXT.to_string(),
            JsonValue::Bool(self.points_to_next_items),
        );
        URL_SAFE_NO_PAD.encode(JsonValue::Object(object).to_string())
    }

    pub fn decode(encoded: &str) -> TheoriaResult<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(encoded.trim_end_matches('='))
            .map_err(|err| TheoriaError::invalid(format!("invalid cursor: {err}")))?;
        let JsonValue::Object(object) = serde_json::from_slice::<JsonValue>(&bytes)
            .map_err(|err| TheoriaError::invalid(format!("invalid cursor: {err}")))?
        else {
            return Err(TheoriaError::invalid("invalid cursor: expected an object"));
        };
        let mut points_to_next_items = true;
        let mut parameters = IndexMap::new();
        for (key, value) in object {
            if key == POINTS_TO_NEXT {
                points_to_next_items = value.as_bool().unwrap_or(true);
            } else {
                parameters.insert(key, scalar(value));
            }
        }
        Ok(Self::new(parameters, points_to_next_items))
    }
}

fn scalar(value: JsonValue) -> Value {
    match value {
        JsonValue::Null => Value::Null,
        JsonValue::Bool(value) => Value::Bool(value),
        JsonValue::Number(number) => match number.as_i64() {
            Some(int) => Value::Int(int),
            None => number.as_f64().map_or(Value::Null, Value::Float),
        },
        JsonValue::String(text) => Value::Text(text),
        other => Value::Json(other),
    }
}

/// Keyset page with links to the neighbouring pages.
#[derive(Clone, Debug)]
pub struct CursorPage<C> {
    data: C,
    count: usize,
    per_page: u64,
    cursor: Option<Cursor>,
    next_cursor: Option<Cursor>,
    previous_cursor: Option<Cursor>,
}

impl<C> CursorPage<C> {
    pub(crate) fn new(
        items: C,
        count: usize,
        per_page: u64,
        cursor: Option<Cursor>,
        next_cursor: Option<Cursor>,
        previous_cursor: Option<Cursor>,
    ) -> Self {
        Self {
            data: items,
            count,
            per_page,
            cursor,
            next_cursor,
            previous_cursor,
        }
    }

    pub fn items(&self) -> &C {
        &self.data
    }

    pub fn into_items(self) -> C {
        self.data
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn per_page(&self) -> u64 {
        self.per_page
    }

    pub fn cursor(&self) -> Option<&Cursor> {
        self.cursor.as_ref()
    }

    pub fn next_cursor(&self) -> Option<&Cursor> {
        self.next_cursor.as_ref()
    }

    pub fn previous_cursor(&self) -> Option<&Cursor> {
        self.previous_cursor.as_ref()
    }

    pub fn has_more_pages(&self) -> bool {
        self.next_cursor.is_some()
    }

    pub fn on_first_page(&self) -> bool {
        self.previous_cursor.is_none()
    }
}

impl<C: Serialize> Serialize for CursorPage<C> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        #[derive(Serialize)]
        struct Wire<'a, C> {
            data: &'a C,
            per_page: u64,
            next_cursor: Option<String>,
            prev_cursor: Option<String>,
        }
        Wire {
            data: &self.data,
            per_page: self.per_page,
            next_cursor: self.next_cursor.as_ref().map(Cursor::encode),
            prev_cursor: self.previous_cursor.as_ref().map(Cursor::encode),
        }
        .serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use indexmap::IndexMap;

    use super::{Cursor, LengthAwarePage, SimplePage};
    use crate::Value;

    #[test]
    fn length_aware_bounds() {
        let page = LengthAwarePage::new(vec![4, 5, 6], 3, 8, 3, 2);
        assert_eq!(page.last_page(), 3);
        assert_eq!(page.first_item(), Some(4));
        assert_eq!(page.last_item(), Some(6));
        assert!(page.has_more_pages());
        assert!(!page.on_first_page());

        let empty = LengthAwarePage::new(Vec::<i32>::new(), 0, 0, 15, 1);
        assert_eq!(empty.last_page(), 1);
        assert_eq!(empty.first_item(), None);
        assert!(!empty.has_more_pages());
        let json = serde_json::to_value(&empty).expect("json");
        assert_eq!(json["total"], 0);
        assert_eq!(json["data"], serde_json::json!([]));
    }

    #[test]
    fn bounds_saturate_on_huge_pages() {
        let page = LengthAwarePage::new(vec![1], 1, u64::MAX, u64::MAX, u64::MAX);
        assert_eq!(page.first_item(), Some(u64::MAX));
        assert_eq!(page.last_item(), Some(u64::MAX));
        assert_eq!(page.last_page(), 1);
    }

    #[test]
    fn simple_page_reports_more_pages() {
        let page = SimplePage::new(vec![1, 2], 2, 2, 1, true);
        assert!(page.has_more_pages());
        assert_eq!(page.first_item(), Some(1));
        assert_eq!(page.last_item(), Some(2));
    }

    #[test]
    fn cursor_encoding_is_url_safe_json() {
        let parameters: IndexMap<String, Value> = [
            ("posts.id".to_string(), Value::Int(42)),
            ("title".to_string(), Value::from("a/b+c")),
        ]
        .into_iter()
        .collect();
        let cursor = Cursor::new(parameters, false);
        let encoded = cursor.encode();
        assert!(!encoded.contains('='));
        assert!(!encoded.contains('+'));
        assert!(!encoded.contains('/'));
        let decoded = Cursor::decode(&encoded).expect("decode");
        assert_eq!(decoded, cursor);
        assert!(decoded.points_to_previous_items());
        assert_eq!(decoded.parameter("posts.id"), Value::Int(42));
        assert!(Cursor::decode("not-json").is_err());
    }
}
