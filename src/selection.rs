use crate::state_machine::{Analysis, SongCandidate};

/// Picks the song used for the video from the generated candidates.
pub trait SongSelector: Send + Sync {
    /// `None` when no candidate is usable.
    fn select(&self, candidates: &[SongCandidate], analysis: Option<&Analysis>) -> Option<SongCandidate>;
}

/// Preferred song length for a short-form video, in seconds.
const IDEAL_DURATION: (f64, f64) = (60.0, 180.0);

/// Weighted scoring over duration and tag overlap. Ties go to the earliest candidate.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScoredSelector;

impl ScoredSelector {
    /// Score of a single candidate, or `None` if it cannot be used at all.
    pub fn score(candidate: &SongCandidate, analysis: Option<&Analysis>) -> Option<u32> {
        if candidate.audio_url.trim().is_empty() {
            return None;
        }

        let mut score: u32 = 0;

        // Duration: full marks inside the window, one point lost per 10s outside it
        score += match candidate.duration_secs {
            Some(d) if !d.is_finite() || d <= 0.0 => return None,
            Some(d) => {
                let (lo, hi) = IDEAL_DURATION;
                let distance = if d < lo {
                    lo - d
                } else if d > hi {
                    d - hi
                } else {
                    0.0
                };
                20u32.saturating_sub((distance / 10.0) as u32)
            }
            None => 5,
        };

        if let Some(analysis) = analysis {
            let wanted: Vec<String> = analysis.tags.iter().map(|t| t.to_lowercase()).collect();
            let overlap = candidate
                .tags
                .iter()
                .filter(|t| wanted.contains(&t.to_lowercase()))
                .count() as u32;
            score += overlap * 5;

            if !analysis.title.is_empty()
                && candidate.title.to_lowercase() == analysis.title.to_lowercase()
            {
                score += 3;
            }
        }

        if !candidate.title.trim().is_empty() {
            score += 1;
        }

        Some(score)
    }
}

impl SongSelector for ScoredSelector {
    fn select(&self, candidates: &[SongCandidate], analysis: Option<&Analysis>) -> Option<SongCandidate> {
        let mut best: Option<(u32, &SongCandidate)> = None;
        for candidate in candidates {
            let Some(score) = Self::score(candidate, analysis) else {
                continue;
            };
            if best.is_none_or(|(top, _)| score > top) {
                best = Some((score, candidate));
            }
        }
        best.map(|(_, c)| c.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn song(id: &str, duration: Option<f64>, tags: &[&str]) -> SongCandidate {
        SongCandidate {
            id: id.into(),
            title: format!("Song {id}"),
            audio_url: format!("https://cdn.example/{id}.mp3"),
            duration_secs: duration,
            tags: tags.iter().map(|t| t.to_string()).collect(),
        }
    }

    fn analysis(tags: &[&str]) -> Analysis {
        Analysis {
            title: "Night Drive".into(),
            music_prompt: "synthwave".into(),
            image_prompt: "neon city".into(),
            style: "retro".into(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
        }
    }

    #[test]
    fn prefers_duration_inside_window() {
        let candidates = vec![song("short", Some(20.0), &[]), song("good", Some(120.0), &[])];
        let chosen = ScoredSelector.select(&candidates, None).unwrap();
        assert_eq!(chosen.id, "good");
    }

    #[test]
    fn tag_overlap_outweighs_small_duration_miss() {
        let candidates = vec![
            song("plain", Some(100.0), &["pop"]),
            song("tagged", Some(200.0), &["Synthwave", "night"]),
        ];
        let chosen = ScoredSelector
            .select(&candidates, Some(&analysis(&["synthwave", "night"])))
            .unwrap();
        assert_eq!(chosen.id, "tagged");
    }

    #[test]
    fn non_finite_durations_are_ineligible() {
        let candidates = vec![
            song("nan", Some(f64::NAN), &[]),
            song("inf", Some(f64::INFINITY), &[]),
            song("short", Some(30.0), &[]),
        ];
        assert_eq!(ScoredSelector::score(&candidates[0], None), None);
        assert_eq!(ScoredSelector.select(&candidates, None).unwrap().id, "short");
    }

    #[test]
    fn ties_go_to_lowest_index() {
        let candidates = vec![song("first", Some(90.0), &[]), song("second", Some(90.0), &[])];
        assert_eq!(ScoredSelector.select(&candidates, None).unwrap().id, "first");
    }

    #[test]
    fn candidates_without_audio_are_ineligible() {
        let mut broken = song("broken", Some(120.0), &[]);
        broken.audio_url = "  ".into();
        assert!(ScoredSelector.select(&[broken.clone()], None).is_none());

        let fallback = song("fallback", Some(10.0), &[]);
        let chosen = ScoredSelector.select(&[broken, fallback], None).unwrap();
        assert_eq!(chosen.id, "fallback");
    }

    #[test]
    fn empty_candidate_list_selects_nothing() {
        assert!(ScoredSelector.select(&[], None).is_none());
    }

    #[test]
    fn unknown_duration_scores_below_ideal() {
        let known = ScoredSelector::score(&song("a", Some(120.0), &[]), None).unwrap();
        let unknown = ScoredSelector::score(&song("b", None, &[]), None).unwrap();
        assert!(known > unknown);
    }
}
