//! Mapping between IDE locations and adapter source paths.

use url::Url;

/// Translates IDE location URLs to the paths the adapter understands and
/// back.
pub trait PathMapper: Send + Sync {
    /// Adapter path for an IDE URL, or `None` when the URL has no path
    /// the adapter could know about.
    fn to_path(&self, url: &str) -> Option<String>;

    /// IDE URL for an adapter path, or `None` when unmappable.
    fn to_url(&self, path: &str) -> Option<String>;
}

/// Maps `file://` URLs to local file system paths.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileUrlMapper;

impl PathMapper for FileUrlMapper {
    fn to_path(&self, url: &str) -> Option<String> {
        let url = Url::parse(url).ok()?;
        match url.scheme() {
            "file" => url
                .to_file_path()
                .ok()
                .map(|path| path.to_string_lossy().into_owned()),
            _ => None,
        }
    }

    fn to_url(&self, path: &str) -> Option<String> {
        Url::from_file_path(path).ok().map(|url| url.to_string())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn paths_file_url_to_path() {
        let mapper = FileUrlMapper;
        assert_eq!(mapper.to_path("file:///a.js").as_deref(), Some("/a.js"));
        assert_eq!(
            mapper.to_path("file:///home/dev/my%20app/index.js").as_deref(),
            Some("/home/dev/my app/index.js")
        );
    }

    #[test]
    fn paths_non_file_urls_are_unmapped() {
        let mapper = FileUrlMapper;
        assert_eq!(mapper.to_path("http://example.com/a.js"), None);
        assert_eq!(mapper.to_path("not a url"), None);
    }

    #[test]
    fn paths_path_to_url() {
        let mapper = FileUrlMapper;
        assert_eq!(mapper.to_url("/src/main.js").as_deref(), Some("file:///src/main.js"));
        assert_eq!(mapper.to_url("relative/main.js"), None);
    }
}
