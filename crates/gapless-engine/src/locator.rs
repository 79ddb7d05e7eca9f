//! Media locators and content resolution.
//!
//! The queue manager hands the engine a string. Plain paths and `file://` URIs are bound
//! directly; any other `scheme://` locator goes through a [`ContentResolver`].

use std::ffi::OsString;
use std::path::PathBuf;

use anyhow::{Result, anyhow};

use crate::handle::MediaSource;

/// Parsed form of a locator string.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Locator {
    File(PathBuf),
    Uri { scheme: String, raw: String },
}

impl Locator {
    pub fn parse(raw: &str) -> Locator {
        let trimmed = raw.trim();
        if let Some(rest) = trimmed.strip_prefix("file://") {
            return Locator::File(path_from_file_uri(rest));
        }
        match scheme_of(trimmed) {
            Some(scheme) => Locator::Uri {
                scheme: scheme.to_ascii_lowercase(),
                raw: trimmed.to_string(),
            },
            None => Locator::File(PathBuf::from(trimmed)),
        }
    }

    /// File extension used as a probe hint, if any.
    pub fn extension_hint(&self) -> Option<String> {
        let ext = match self {
            Locator::File(path) => path.extension()?.to_str()?.to_string(),
            Locator::Uri { raw, .. } => {
                let tail = raw.rsplit('/').next()?;
                let tail = tail.split(['?', '#']).next()?;
                tail.rsplit_once('.')?.1.to_string()
            }
        };
        if ext.is_empty() { None } else { Some(ext.to_ascii_lowercase()) }
    }
}

/// Returns the scheme when `s` looks like `scheme://...`.
///
/// Single-letter schemes are rejected so Windows drive paths (`C://...`) stay paths.
fn scheme_of(s: &str) -> Option<&str> {
    let (scheme, _) = s.split_once("://")?;
    let mut chars = scheme.chars();
    let first = chars.next()?;
    if scheme.len() < 2 || !first.is_ascii_alphabetic() {
        return None;
    }
    if chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.')) {
        Some(scheme)
    } else {
        None
    }
}

/// Percent-decode the path part of a `file://` URI, keeping non-UTF-8 bytes on unix.
fn path_from_file_uri(rest: &str) -> PathBuf {
    let bytes = urlencoding::decode_binary(rest.as_bytes()).into_owned();
    PathBuf::from(os_string_from_bytes(bytes))
}

#[cfg(unix)]
fn os_string_from_bytes(bytes: Vec<u8>) -> OsString {
    use std::os::unix::ffi::OsStringExt;
    OsString::from_vec(bytes)
}

#[cfg(not(unix))]
fn os_string_from_bytes(bytes: Vec<u8>) -> OsString {
    OsString::from(String::from_utf8_lossy(&bytes).into_owned())
}

/// Translates a non-file locator into an openable stream.
pub trait ContentResolver: Send + Sync {
    fn open(&self, locator: &Locator) -> Result<MediaSource>;
}

/// Resolver for setups with no content provider: every non-file locator fails to bind.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoContentResolver;

impl ContentResolver for NoContentResolver {
    fn open(&self, locator: &Locator) -> Result<MediaSource> {
        Err(anyhow!("no content resolver for {locator:?}"))
    }
}

/// Resolve `raw` into something a handle can bind to.
pub(crate) fn resolve(raw: &str, resolver: &dyn ContentResolver) -> Result<MediaSource> {
    match Locator::parse(raw) {
        Locator::File(path) => Ok(MediaSource::Path(path)),
        uri @ Locator::Uri { .. } => resolver.open(&uri),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_paths_are_files() {
        assert_eq!(
            Locator::parse("/music/a.flac"),
            Locator::File(PathBuf::from("/music/a.flac"))
        );
        assert_eq!(
            Locator::parse("relative/b.mp3"),
            Locator::File(PathBuf::from("relative/b.mp3"))
        );
    }

    #[test]
    fn file_uri_is_decoded() {
        assert_eq!(
            Locator::parse("file:///music/My%20Song.flac"),
            Locator::File(PathBuf::from("/music/My Song.flac"))
        );
    }

    #[test]
    fn other_schemes_are_uris() {
        let loc = Locator::parse("content://media/external/audio/42");
        assert_eq!(
            loc,
            Locator::Uri {
                scheme: "content".to_string(),
                raw: "content://media/external/audio/42".to_string()
            }
        );
    }

    #[test]
    fn drive_letters_are_not_schemes() {
        assert!(matches!(Locator::parse("C://music/a.wav"), Locator::File(_)));
    }

    #[test]
    fn extension_hint_ignores_query() {
        let loc = Locator::parse("http://host/track.OGG?token=1");
        assert_eq!(loc.extension_hint(), Some("ogg".to_string()));
        let loc = Locator::parse("/music/a.flac");
        assert_eq!(loc.extension_hint(), Some("flac".to_string()));
        let loc = Locator::parse("/music/noext");
        assert_eq!(loc.extension_hint(), None);
    }

    #[test]
    fn file_uri_keeps_malformed_escapes() {
        assert_eq!(
            Locator::parse("file:///m/a%zzb%41.wav"),
            Locator::File(PathBuf::from("/m/a%zzbA.wav"))
        );
    }

    #[cfg(unix)]
    #[test]
    fn file_uri_keeps_non_utf8_bytes() {
        use std::os::unix::ffi::OsStrExt;

        let Locator::File(path) = Locator::parse("file:///m/%FF.flac") else {
            panic!("expected a file locator");
        };
        assert_eq!(path.as_os_str().as_bytes(), b"/m/\xff.flac");
        assert_eq!(path.extension().and_then(|e| e.to_str()), Some("flac"));
    }

    #[test]
    fn no_resolver_rejects_uris() {
        let err = resolve("content://x/1", &NoContentResolver);
        assert!(err.is_err());
        let ok = resolve("/tmp/a.wav", &NoContentResolver).unwrap();
        assert!(matches!(ok, MediaSource::Path(_)));
    }
}
