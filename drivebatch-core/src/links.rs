use url::Url;

/// Extracts a file or folder id from a shared link, or returns the input when
/// it already is a bare id.
///
/// Recognised forms: `/file/d/<id>/...`, `/drive/folders/<id>`,
/// `/document/d/<id>/edit` and `?id=<id>`.
pub fn extract_file_id(input: &str) -> Option<String> {
    let input = input.trim();
    let Ok(url) = Url::parse(input) else {
        return is_valid_id(input).then(|| input.to_string());
    };

    if let Some(segments) = url.path_segments() {
        let segments: Vec<&str> = segments.collect();
        for pair in segments.windows(2) {
            let (marker, candidate) = (pair[0], pair[1]);
            if matches!(marker, "d" | "folders") && is_valid_id(candidate) {
                return Some(candidate.to_string());
            }
        }
    }

    url.query_pairs()
        .find(|(key, _)| key == "id")
        .map(|(_, value)| value.into_owned())
        .filter(|value| is_valid_id(value))
}

fn is_valid_id(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
