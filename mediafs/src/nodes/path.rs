/// Splits an absolute or relative virtual path into its non-empty segments.
/// `"/"` and `""` both yield no segments, which denotes the root.
pub fn path_segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// Joins a parent path and a child name into an absolute path.
pub fn join_path(parent: &str, name: &str) -> String {
    let parent = parent.trim_end_matches('/');
    format!("{}/{}", parent, name)
}

/// Turns a remote title into something usable as a single path component.
/// Slashes and NUL bytes can't appear in a name, and `.` / `..` would alias
/// other directories.
pub fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| *c != '\0')
        .map(|c| if c == '/' { '-' } else { c })
        .collect();
    let trimmed = cleaned.trim();

    match trimmed {
        "" => "_".to_string(),
        "." | ".." => format!("_{}", trimmed),
        _ => trimmed.to_string(),
    }
}

/// Makes a name unique among its siblings by appending the entry's id.
/// For files the id goes in front of the extension, so it stays intact.
pub fn disambiguate_name(name: &str, id: &str, keep_extension: bool) -> String {
    if keep_extension {
        if let Some(dot) = name.rfind('.').filter(|i| *i > 0) {
            let (stem, extension) = name.split_at(dot);
            return format!("{} [{}]{}", stem, id, extension);
        }
    }
    format!("{} [{}]", name, id)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::{disambiguate_name, join_path, path_segments, sanitize_name};

    #[rstest]
    #[case::root("/", vec![])]
    #[case::empty("", vec![])]
    #[case::nested("/Movies/Alien (1979).mkv", vec!["Movies", "Alien (1979).mkv"])]
    #[case::double_slash("//a//b/", vec!["a", "b"])]
    fn segments(#[case] path: &str, #[case] expected: Vec<&str>) {
        assert_eq!(expected, path_segments(path));
    }

    #[test]
    fn join() {
        assert_eq!("/a", join_path("/", "a"));
        assert_eq!("/a/b", join_path("/a", "b"));
    }

    #[rstest]
    #[case::slash("AC/DC", "AC-DC")]
    #[case::nul("a\0b", "ab")]
    #[case::dot(".", "_.")]
    #[case::dotdot("..", "_..")]
    #[case::blank("  ", "_")]
    #[case::plain("Alien", "Alien")]
    fn sanitize(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(expected, sanitize_name(input));
    }

    #[rstest]
    #[case::file("Alien (1979).mkv", true, "Alien (1979) [101].mkv")]
    #[case::no_extension("Alien (1979)", true, "Alien (1979) [101]")]
    #[case::hidden(".mkv", true, ".mkv [101]")]
    #[case::directory("Season 01", false, "Season 01 [101]")]
    fn disambiguate(#[case] name: &str, #[case] keep_extension: bool, #[case] expected: &str) {
        assert_eq!(expected, disambiguate_name(name, "101", keep_extension));
    }
}
