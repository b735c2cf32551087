//! Named package-index mirrors.

use std::collections::BTreeMap;

use crate::error::MirrorError;

/// Name → index URL, as stored in the `[mirrors]` config section.
pub type Mirrors = BTreeMap<String, String>;

/// Accepts absolute http(s) URLs with a host and no whitespace.
pub fn check_index_url(url: &str) -> bool {
    let rest = match url.split_once("://") {
        Some(("http", rest)) | Some(("https", rest)) => rest,
        _ => return false,
    };
    let host = rest.split(['/', '?', '#']).next().unwrap_or("");
    !host.is_empty() && !url.chars().any(char::is_whitespace)
}

pub fn add_mirror(mirrors: &mut Mirrors, name: &str, url: &str) -> Result<(), MirrorError> {
    let name = name.trim();
    let url = url.trim();
    if name.is_empty() {
        return Err(MirrorError::EmptyName);
    }
    if url.is_empty() {
        return Err(MirrorError::EmptyUrl);
    }
    if !check_index_url(url) {
        return Err(MirrorError::InvalidUrl(url.to_string()));
    }
    if mirrors.contains_key(name) {
        return Err(MirrorError::Duplicate(name.to_string()));
    }
    mirrors.insert(name.to_string(), url.to_string());
    Ok(())
}

pub fn remove_mirror(mirrors: &mut Mirrors, name: &str) -> Result<String, MirrorError> {
    mirrors
        .remove(name)
        .ok_or_else(|| MirrorError::Unknown(name.to_string()))
}

/// Looks `name_or_url` up as a mirror name first, then accepts it as a URL.
pub fn resolve<'a>(mirrors: &'a Mirrors, name_or_url: &'a str) -> Result<&'a str, MirrorError> {
    if let Some(url) = mirrors.get(name_or_url) {
        return Ok(url);
    }
    if check_index_url(name_or_url) {
        Ok(name_or_url)
    } else {
        Err(MirrorError::Unknown(name_or_url.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_index_url() {
        assert!(check_index_url("https://pypi.tuna.tsinghua.edu.cn/simple"));
        assert!(check_index_url("http://localhost:8080"));
        assert!(!check_index_url("ftp://mirror.example/simple"));
        assert!(!check_index_url("https:///simple"));
        assert!(!check_index_url("pypi.org/simple"));
        assert!(!check_index_url("https://pypi.org/sim ple"));
    }

    #[test]
    fn test_add_and_remove_mirror() {
        let mut mirrors = Mirrors::new();
        add_mirror(&mut mirrors, " tuna ", "https://pypi.tuna.tsinghua.edu.cn/simple").unwrap();
        assert_eq!(mirrors["tuna"], "https://pypi.tuna.tsinghua.edu.cn/simple");

        assert!(matches!(
            add_mirror(&mut mirrors, "tuna", "https://other.example/simple"),
            Err(MirrorError::Duplicate(_))
        ));
        assert!(matches!(add_mirror(&mut mirrors, "", "https://x.example"), Err(MirrorError::EmptyName)));
        assert!(matches!(add_mirror(&mut mirrors, "x", " "), Err(MirrorError::EmptyUrl)));
        assert!(matches!(add_mirror(&mut mirrors, "x", "nope"), Err(MirrorError::InvalidUrl(_))));

        assert!(remove_mirror(&mut mirrors, "tuna").is_ok());
        assert!(matches!(remove_mirror(&mut mirrors, "tuna"), Err(MirrorError::Unknown(_))));
    }

    #[test]
    fn test_resolve_prefers_names() {
        let mut mirrors = Mirrors::new();
        mirrors.insert("aliyun".into(), "https://mirrors.aliyun.com/pypi/simple".into());
        assert_eq!(resolve(&mirrors, "aliyun").unwrap(), "https://mirrors.aliyun.com/pypi/simple");
        assert_eq!(resolve(&mirrors, "https://pypi.org/simple").unwrap(), "https://pypi.org/simple");
        assert!(resolve(&mirrors, "douban").is_err());
    }
}
