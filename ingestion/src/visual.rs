/// Heuristic for chart/table-like chunks that deserve an LLM re-explanation
/// before storage: dense digits, or several visual markers at once.

const MIN_VISUAL_LEN: usize = 80;
const DIGIT_RATIO_THRESHOLD: f64 = 0.35;
const MIN_MARKER_HITS: usize = 2;

const MARKERS: [&str; 16] = [
    "%", "chart", "graph", "table", "figure", "axis", "source:", "year", "2019", "2020", "2021",
    "2022", "2023", "2024", "2025", "2026",
];

pub fn is_visual(text: &str) -> bool {
    let len = text.chars().count();
    if len < MIN_VISUAL_LEN {
        return false;
    }

    let digits = text.chars().filter(|c| c.is_ascii_digit()).count();
    if digits as f64 / len as f64 > DIGIT_RATIO_THRESHOLD {
        return true;
    }

    let lower = text.to_lowercase();
    MARKERS.iter().filter(|m| lower.contains(*m)).count() >= MIN_MARKER_HITS
}
