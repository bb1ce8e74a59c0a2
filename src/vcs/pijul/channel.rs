use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Channel {
    pub name: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub is_current: bool,
}

/// Parses `pijul channel`, where `* ` marks the current channel:
///
/// ```text
/// * main
///   feature
/// ```
pub fn parse_channels(output: &str) -> Vec<Channel> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let is_current = line.starts_with("* ");
            let name = line.strip_prefix("* ").unwrap_or(line).trim();
            (!name.is_empty()).then(|| Channel {
                name: name.to_string(),
                is_current,
            })
        })
        .collect()
}

/// `main` if present, otherwise the first channel, otherwise `main`.
pub fn default_channel(channels: &[Channel]) -> String {
    if channels.iter().any(|c| c.name == "main") {
        return "main".to_string();
    }
    channels
        .first()
        .map_or_else(|| "main".to_string(), |c| c.name.clone())
}

/// Offset/limit window; a zero limit keeps everything after `offset`.
pub fn paginate<T>(items: Vec<T>, offset: usize, limit: usize) -> Vec<T> {
    let iter = items.into_iter().skip(offset);
    if limit > 0 {
        iter.take(limit).collect()
    } else {
        iter.collect()
    }
}
