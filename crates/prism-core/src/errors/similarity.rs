/// Closest known column name for an unknown one, for "did you mean" hints.
pub fn closest_name<'a>(needle: &str, hay: impl Iterator<Item = &'a str>) -> Option<String> {
    let mut best: Option<(f64, &str)> = None;

    const THRESHOLD: f64 = 0.55;

    for candidate in hay {
        let sim = strsim::normalized_levenshtein(needle, candidate);
        if sim >= THRESHOLD && best.map_or(true, |(b, _)| sim > b) {
            best = Some((sim, candidate));
        }
    }
    best.map(|(_, name)| name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_name_wins() {
        let names = ["label", "output"];
        assert_eq!(
            closest_name("label", names.iter().copied()).as_deref(),
            Some("label")
        );
    }

    #[test]
    fn typo_is_suggested() {
        let names = ["OUTPUToutputgpt-4_v1", "label"];
        assert_eq!(
            closest_name("lable", names.iter().copied()).as_deref(),
            Some("label")
        );
    }

    #[test]
    fn unrelated_name_has_no_suggestion() {
        let names = ["zulu", "bar"];
        assert!(closest_name("alpha", names.iter().copied()).is_none());
    }
}
