//! Canonical forms for media URLs stored in scene records.

/// Relative media prefixes and their canonical rooted form.
const RELATIVE_PREFIXES: &[(&str, &str)] = &[
	("./assets/", "/assets/"),
	("assets/", "/assets/"),
	("./uploads/", "/uploads/"),
	("uploads/", "/uploads/"),
];

const DOUBLED_ASSETS: &str = "/assets/assets/";

fn has_scheme(url: &str) -> bool {
	match url.split_once("://") {
		Some((scheme, _)) => {
			let mut chars = scheme.chars();
			chars.next().map(|c| c.is_ascii_alphabetic()).unwrap_or(false)
				&& chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
		}
		None => false,
	}
}

/// Canonicalize a media URL before it is persisted.
///
/// Absolute (scheme-prefixed) URLs pass through untouched. Relative
/// `assets/` and `uploads/` forms become rooted, doubled `/assets/assets/`
/// segments collapse, and the query string (cache-busting timestamps) is
/// dropped unless `keep_query` is set. Applying it twice is a no-op.
pub fn normalize_url(url: &str, keep_query: bool) -> String {
	if has_scheme(url) {
		return url.to_string();
	}
	let (base, query) = match url.split_once('?') {
		Some((b, q)) => (b, Some(q)),
		None => (url, None),
	};
	let mut out = base.to_string();
	for (rel, canon) in RELATIVE_PREFIXES {
		if let Some(rest) = out.strip_prefix(rel) {
			out = format!("{canon}{rest}");
			break;
		}
	}
	while out.contains(DOUBLED_ASSETS) {
		out = out.replace(DOUBLED_ASSETS, "/assets/");
	}
	if keep_query {
		if let Some(q) = query {
			out.push('?');
			out.push_str(q);
		}
	}
	out
}

/// Normalize a JSON value in place when it holds a string.
pub fn normalize_value(value: &mut serde_json::Value) {
	if let serde_json::Value::String(s) = value {
		let normalized = normalize_url(s, false);
		if normalized != *s {
			*s = normalized;
		}
	}
}
