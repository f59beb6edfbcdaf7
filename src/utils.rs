/// Joins POSIX-style path segments and normalizes the result.
///
/// Segments are taken right to left; the first absolute segment met this way
/// discards everything before it. Runs of `/` collapse, `.` is dropped and
/// `..` removes the preceding component without ever climbing above `/`.
/// A trailing `/` is stripped unless the result is the root itself.
///
/// ```ignore
/// assert_eq!(resolve(["/sdcard", "DCIM", "..", "Music"]), "/sdcard/Music");
/// assert_eq!(resolve(["/sdcard", "/data"]), "/data");
/// ```
pub fn resolve<I, S>(segments: I) -> String
where
    I: IntoIterator<Item = S>,
    I::IntoIter: DoubleEndedIterator,
    S: AsRef<str>,
{
    let mut joined = String::new();
    let mut absolute = false;
    for segment in segments.into_iter().rev() {
        let segment = segment.as_ref();
        if segment.is_empty() {
            continue;
        }
        joined = format!("{segment}/{joined}");
        if segment.starts_with('/') {
            absolute = true;
            break;
        }
    }

    let mut components: Vec<&str> = Vec::new();
    for component in joined.split('/') {
        match component {
            "" | "." => {}
            ".." => match components.last() {
                Some(&last) if last != ".." => {
                    components.pop();
                }
                // the root has no parent
                _ if absolute => {}
                _ => components.push(".."),
            },
            name => components.push(name),
        }
    }

    let body = components.join("/");
    if absolute { format!("/{body}") } else { body }
}

/// Extension of `name` including the dot.
///
/// A name without any `.` is returned whole, not as an empty string.
pub fn extname(name: &str) -> &str {
    match name.rfind('.') {
        Some(index) => &name[index..],
        None => name,
    }
}

/// Quotes `arg` for a POSIX shell command line
pub fn shell_quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_parent_segment() {
        assert_eq!(resolve(["/a", "b", "..", "c"]), "/a/c");
    }

    #[test]
    fn test_resolve_later_absolute_wins() {
        assert_eq!(resolve(["/a/b/", "/x"]), "/x");
        assert_eq!(resolve(["/a", "/b", "c"]), "/b/c");
    }

    #[test]
    fn test_resolve_root_and_slashes() {
        assert_eq!(resolve(["/"]), "/");
        assert_eq!(resolve(["///"]), "/");
        assert_eq!(resolve(["/", "sdcard"]), "/sdcard");
        assert_eq!(resolve(["//sdcard//DCIM/"]), "/sdcard/DCIM");
        assert_eq!(resolve(["/", ".."]), "/");
        assert_eq!(resolve(["/sdcard", "..", "..", "data"]), "/data");
    }

    #[test]
    fn test_resolve_dot_and_empty_segments() {
        assert_eq!(resolve(["/sdcard", "", ".", "./Music/."]), "/sdcard/Music");
    }

    #[test]
    fn test_resolve_relative_inputs() {
        assert_eq!(resolve(["a", "b"]), "a/b");
        assert_eq!(resolve(["a", ".."]), "");
        assert_eq!(resolve(["..", "a"]), "../a");
    }

    #[test]
    fn test_resolve_is_idempotent() {
        for input in [
            vec!["/a", "b", "..", "c"],
            vec!["/", "x", "./y//z/"],
            vec!["/a/b/", "/x"],
            vec!["rel", "..", "..", "up"],
            vec!["/"],
        ] {
            let once = resolve(&input);
            assert_eq!(resolve([once.as_str()]), once);
        }
    }

    #[test]
    fn test_extname() {
        assert_eq!(extname("file"), "file");
        assert_eq!(extname("a.tar.gz"), ".gz");
        assert_eq!(extname(".bashrc"), ".bashrc");
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/sdcard/My Files"), "'/sdcard/My Files'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
