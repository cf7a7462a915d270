//! Decides, once per sampling tick, whether a property upload goes out and
//! which shape it takes.

use serde::Serialize;

use crate::config::Timing;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadKind {
    /// Every property, outputs and username included.
    Full,
    /// Temperature, humidity and smoke only; heartbeat while nobody is
    /// logged in.
    Reduced,
}

#[derive(Debug, Clone)]
pub struct UploadScheduler {
    full_every: u32,
    reduced_every: u32,
    full_count: u32,
    reduced_count: u32,
}

impl UploadScheduler {
    pub fn new(full_every: u32, reduced_every: u32) -> Self {
        Self {
            full_every,
            reduced_every,
            full_count: 0,
            reduced_count: 0,
        }
    }

    pub fn from_timing(timing: &Timing) -> Self {
        Self::new(timing.full_upload_every, timing.reduced_upload_every)
    }

    /// Advance both counters one tick. `force` is the consumed force-upload
    /// flag; `has_user` is whether a card or admin holds the workstation.
    pub fn tick(&mut self, force: bool, has_user: bool) -> Option<UploadKind> {
        self.full_count = self.full_count.saturating_add(1);
        self.reduced_count = self.reduced_count.saturating_add(1);

        let mut full = false;
        if self.full_count >= self.full_every {
            full = true;
            self.full_count = 0;
        }

        if force {
            full = true;
            self.full_count = 0;
            self.reduced_count = 0;
        } else if has_user {
            self.reduced_count = 0;
        }

        let mut reduced = false;
        if !has_user && self.reduced_count >= self.reduced_every {
            reduced = true;
            self.reduced_count = 0;
        }

        if full {
            Some(UploadKind::Full)
        } else if reduced {
            Some(UploadKind::Reduced)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ticks(s: &mut UploadScheduler, n: usize, force: bool, has_user: bool) -> Vec<Option<UploadKind>> {
        (0..n).map(|_| s.tick(force, has_user)).collect()
    }

    fn positions(out: &[Option<UploadKind>], kind: UploadKind) -> Vec<usize> {
        out.iter()
            .enumerate()
            .filter(|(_, k)| **k == Some(kind))
            .map(|(i, _)| i + 1)
            .collect()
    }

    #[test]
    fn idle_without_user_emits_reduced_every_six_and_full_every_twelve() {
        let mut s = UploadScheduler::new(12, 6);
        let out = ticks(&mut s, 24, false, false);
        assert_eq!(positions(&out, UploadKind::Full), [12, 24]);
        // Tick 12 is both due; Full wins.
        assert_eq!(positions(&out, UploadKind::Reduced), [6, 18]);
    }

    #[test]
    fn logged_in_user_suppresses_reduced() {
        let mut s = UploadScheduler::new(12, 6);
        let out = ticks(&mut s, 24, false, true);
        assert_eq!(positions(&out, UploadKind::Full), [12, 24]);
        assert!(positions(&out, UploadKind::Reduced).is_empty());
    }

    #[test]
    fn force_uploads_full_and_restarts_both_counters() {
        let mut s = UploadScheduler::new(12, 6);
        ticks(&mut s, 4, false, false);
        assert_eq!(s.tick(true, false), Some(UploadKind::Full));

        let out = ticks(&mut s, 12, false, false);
        assert_eq!(positions(&out, UploadKind::Reduced), [6]);
        assert_eq!(positions(&out, UploadKind::Full), [12]);
    }

    #[test]
    fn force_with_user_is_full() {
        let mut s = UploadScheduler::new(12, 6);
        assert_eq!(s.tick(true, true), Some(UploadKind::Full));
        assert_eq!(s.tick(false, true), None);
    }

    #[test]
    fn reduced_resumes_after_logout() {
        let mut s = UploadScheduler::new(12, 6);
        ticks(&mut s, 3, false, true);
        let out = ticks(&mut s, 6, false, false);
        assert_eq!(positions(&out, UploadKind::Reduced), [6]);
    }

    #[test]
    fn from_timing_uses_configured_periods() {
        let timing = Timing {
            full_upload_every: 3,
            reduced_upload_every: 2,
            ..Timing::default()
        };
        let mut s = UploadScheduler::from_timing(&timing);
        let out = ticks(&mut s, 3, false, false);
        assert_eq!(out, [None, Some(UploadKind::Reduced), Some(UploadKind::Full)]);
    }
}
