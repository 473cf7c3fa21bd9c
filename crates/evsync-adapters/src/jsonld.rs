//! schema.org Event extraction from HTML, shared by the page and site scrapers.
//!
//! JSON-LD blocks are taken as-is. Microdata is rebuilt into the same JSON shape
//! so downstream normalization sees one format.

use scraper::{ElementRef, Html, Selector};
use serde_json::{Map, Value as JsonValue};

fn selector(css: &str) -> Option<Selector> {
    Selector::parse(css).ok()
}

fn type_names(value: &JsonValue) -> Vec<&str> {
    match value.get("@type") {
        Some(JsonValue::String(s)) => vec![s.as_str()],
        Some(JsonValue::Array(items)) => items.iter().filter_map(JsonValue::as_str).collect(),
        _ => Vec::new(),
    }
}

/// `Event` and its subtypes (`MusicEvent`, `ComedyEvent`, ...).
pub fn is_event_type(value: &JsonValue) -> bool {
    type_names(value).iter().any(|t| {
        let t = t.rsplit('/').next().unwrap_or(t);
        t.ends_with("Event")
    })
}

fn collect_events(value: JsonValue, out: &mut Vec<JsonValue>) {
    match value {
        JsonValue::Array(items) => {
            for item in items {
                collect_events(item, out);
            }
        }
        JsonValue::Object(mut map) => {
            if let Some(graph) = map.remove("@graph") {
                collect_events(graph, out);
            }
            let value = JsonValue::Object(map);
            if is_event_type(&value) {
                out.push(value);
            }
        }
        _ => {}
    }
}

/// Every schema.org Event found in `<script type="application/ld+json">` blocks.
/// Unparseable blocks are skipped.
pub fn extract_jsonld_events(html: &str) -> Vec<JsonValue> {
    let document = Html::parse_document(html);
    let Some(sel) = selector(r#"script[type="application/ld+json"]"#) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for script in document.select(&sel) {
        let text = script.text().collect::<String>();
        if let Ok(value) = serde_json::from_str::<JsonValue>(text.trim()) {
            collect_events(value, &mut out);
        }
    }
    out
}

fn nearest_scope<'a>(el: ElementRef<'a>) -> Option<ElementRef<'a>> {
    el.ancestors()
        .filter_map(ElementRef::wrap)
        .find(|a| a.value().attr("itemscope").is_some())
}

/// Item properties that belong directly to `scope`, not to a nested item.
fn own_props<'a>(scope: ElementRef<'a>, sel: &Selector) -> Vec<ElementRef<'a>> {
    scope
        .select(sel)
        .filter(|el| nearest_scope(*el).is_some_and(|s| s.id() == scope.id()))
        .collect()
}

fn prop_value(el: ElementRef<'_>) -> Option<String> {
    let v = el.value();
    let attr = match v.name() {
        "a" | "link" => v.attr("href"),
        "img" | "source" => v.attr("src"),
        "time" => v.attr("datetime"),
        "data" | "meter" => v.attr("value"),
        _ => None,
    };
    let raw = v
        .attr("content")
        .or(attr)
        .map(str::to_string)
        .unwrap_or_else(|| el.text().collect::<String>());
    let trimmed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    (!trimmed.is_empty()).then_some(trimmed)
}

fn item_to_json(scope: ElementRef<'_>, prop_sel: &Selector) -> JsonValue {
    let mut map = Map::new();
    if let Some(itemtype) = scope.value().attr("itemtype") {
        let short = itemtype.rsplit('/').next().unwrap_or(itemtype);
        map.insert("@type".into(), JsonValue::String(short.to_string()));
    }
    for el in own_props(scope, prop_sel) {
        let Some(names) = el.value().attr("itemprop") else {
            continue;
        };
        let value = if el.value().attr("itemscope").is_some() {
            item_to_json(el, prop_sel)
        } else {
            match prop_value(el) {
                Some(v) => JsonValue::String(v),
                None => continue,
            }
        };
        for name in names.split_whitespace() {
            map.entry(name.to_string()).or_insert_with(|| value.clone());
        }
    }
    JsonValue::Object(map)
}

/// schema.org Events marked up as microdata, rebuilt into JSON-LD shape.
pub fn extract_microdata_events(html: &str) -> Vec<JsonValue> {
    let document = Html::parse_document(html);
    let (Some(scope_sel), Some(prop_sel)) = (
        selector(r#"[itemscope][itemtype*="schema.org/"]"#),
        selector("[itemprop]"),
    ) else {
        return Vec::new();
    };
    document
        .select(&scope_sel)
        // Nested items are emitted through their parent.
        .filter(|el| el.value().attr("itemprop").is_none())
        .map(|el| item_to_json(el, &prop_sel))
        .filter(is_event_type)
        .collect()
}

/// Content of the first `<meta property=...>` or `<meta name=...>` tag.
pub fn meta_content(html: &str, key: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let sel = selector(&format!(r#"meta[property="{key}"], meta[name="{key}"]"#))?;
    document
        .select(&sel)
        .filter_map(|m| m.value().attr("content"))
        .map(str::trim)
        .find(|c| !c.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    const JSONLD_PAGE: &str = r#"
        <html><head>
        <script type="application/ld+json">
        {"@context":"https://schema.org","@graph":[
            {"@type":"Organization","name":"The Crocodile"},
            {"@type":"MusicEvent","name":"Night Shift","startDate":"2026-05-01T20:00:00-07:00"}
        ]}
        </script>
        <script type="application/ld+json">[{"@type":"Event","name":"Open Mic"}]</script>
        <script type="application/ld+json">{ not json</script>
        </head><body></body></html>
    "#;

    #[test]
    fn jsonld_events_are_found_in_graphs_and_arrays() {
        let events = extract_jsonld_events(JSONLD_PAGE);
        let names: Vec<&str> = events
            .iter()
            .filter_map(|e| e.get("name").and_then(JsonValue::as_str))
            .collect();
        assert_eq!(names, vec!["Night Shift", "Open Mic"]);
    }

    #[test]
    fn microdata_events_keep_nested_places_separate() {
        let html = r#"
            <div itemscope itemtype="https://schema.org/ComedyEvent">
              <h2 itemprop="name">Late Laughs</h2>
              <meta itemprop="startDate" content="2026-05-02T21:00">
              <a itemprop="url" href="https://venue.example/shows/late-laughs">Tickets</a>
              <div itemprop="location" itemscope itemtype="https://schema.org/Place">
                <span itemprop="name">Comedy Underground</span>
                <span itemprop="address">109 S Washington St, Seattle, WA</span>
              </div>
            </div>
            <div itemscope itemtype="https://schema.org/Person"><span itemprop="name">x</span></div>
        "#;
        let events = extract_microdata_events(html);
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event["@type"], "ComedyEvent");
        assert_eq!(event["name"], "Late Laughs");
        assert_eq!(event["startDate"], "2026-05-02T21:00");
        assert_eq!(event["url"], "https://venue.example/shows/late-laughs");
        assert_eq!(event["location"]["name"], "Comedy Underground");
    }

    #[test]
    fn reads_meta_tags_by_property_or_name() {
        let html = r#"<html><head><meta property="fb:page_id" content=" 12345 "></head></html>"#;
        assert_eq!(meta_content(html, "fb:page_id").as_deref(), Some("12345"));
        assert_eq!(meta_content(html, "og:url"), None);
    }
}
