use std::path::Path;

use pixcache::{ImageError, LocalFileImageDataProvider, Source};
use url::Url;

use crate::error::AppError;

/// Function to parse size with units
pub fn parse_size(size_str: &str) -> Result<u64, AppError> {
    let size_str = size_str.trim().to_lowercase();
    if size_str.is_empty() {
        return Err(AppError::ParseError("Invalid format: empty string".to_string()));
    }

    let split = size_str
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(size_str.len());
    let (numeric_part, unit_part) = size_str.split_at(split);

    let value = numeric_part
        .parse::<f64>()
        .map_err(|_| AppError::ParseError(format!("Invalid number: {numeric_part}")))?;

    let multiplier = match unit_part.trim() {
        "" | "b" => 1.0,
        "kb" => 1024.0,
        "mb" => 1024.0 * 1024.0,
        "gb" => 1024.0 * 1024.0 * 1024.0,
        unit => return Err(AppError::ParseError(format!("Invalid unit: {unit}"))),
    };
    Ok((value * multiplier) as u64)
}

/// Convert bytes to a human-readable format
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.2} {}", UNITS[unit])
    }
}

/// URLs go through `Source::from`; anything else is read as a local file.
pub fn parse_source(input: &str) -> Result<Source, AppError> {
    match Url::parse(input) {
        Ok(url) => Ok(Source::from(url)),
        Err(_) => {
            let path = Path::new(input);
            let absolute = if path.is_absolute() {
                path.to_path_buf()
            } else {
                std::env::current_dir()?.join(path)
            };
            let provider = LocalFileImageDataProvider::from_path(absolute)
                .map_err(|e: ImageError| AppError::InvalidInput(format!("{input}: {e}")))?;
            Ok(Source::provider(provider))
        }
    }
}

pub fn parse_sources(inputs: &[String]) -> Result<Vec<Source>, AppError> {
    inputs.iter().map(|input| parse_source(input)).collect()
}

/// File name for a retrieved image: the last URL segment, else the index.
pub fn output_file_name(source: &Source, index: usize, extension: &str) -> String {
    let stem = source
        .url()
        .and_then(|url| url.path_segments())
        .and_then(|mut segments| segments.next_back())
        .filter(|segment| !segment.is_empty())
        .map(str::to_string);
    match stem {
        Some(name) if Path::new(&name).extension().is_some() => name,
        Some(name) => format!("{name}.{extension}"),
        None => format!("image-{index}.{extension}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size_units() {
        assert_eq!(parse_size("0").unwrap(), 0);
        assert_eq!(parse_size("512").unwrap(), 512);
        assert_eq!(parse_size("2KB").unwrap(), 2048);
        assert_eq!(parse_size("1.5 mb").unwrap(), 1_572_864);
        assert!(parse_size("").is_err());
        assert!(parse_size("3 parsecs").is_err());
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(10), "10 B");
        assert_eq!(format_bytes(2048), "2.00 KB");
    }

    #[test]
    fn test_output_file_name() {
        let source = parse_source("https://example.com/img/cat.png?v=1").unwrap();
        assert_eq!(output_file_name(&source, 0, "png"), "cat.png");

        let bare = parse_source("https://example.com/").unwrap();
        assert_eq!(output_file_name(&bare, 3, "jpeg"), "image-3.jpeg");
    }

    #[test]
    fn test_file_url_is_not_a_network_source() {
        let source = parse_source("file:///srv/images/cat.png").unwrap();
        assert!(!source.is_network());
        assert_eq!(output_file_name(&source, 0, "png"), "cat.png");
    }
}
