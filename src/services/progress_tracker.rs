use crate::models::drops::DropCampaign;
use std::collections::HashMap;
use std::time::Duration;

const MINUTE: Duration = Duration::from_secs(60);

/// Tracked progress of a single drop.
#[derive(Debug, Clone)]
pub struct DropProgress {
    pub drop_id: String,
    pub drop_name: String,
    pub campaign_id: String,
    pub campaign_name: String,
    pub game_id: String,
    pub game_name: String,
    pub required_minutes: u32,
    pub is_claimed: bool,
    watched: Duration,
    completion_reported: bool,
}

impl DropProgress {
    fn required(&self) -> Duration {
        MINUTE * self.required_minutes
    }

    pub fn watched(&self) -> Duration {
        self.watched
    }

    pub fn current_minutes(&self) -> u32 {
        (self.watched.as_secs() / 60).min(self.required_minutes as u64) as u32
    }

    /// Completion percentage, clamped to 0-100.
    pub fn percentage(&self) -> f64 {
        if self.is_claimed || self.required_minutes == 0 {
            return 100.0;
        }
        let ratio = self.watched.as_secs_f64() / self.required().as_secs_f64();
        (ratio * 100.0).clamp(0.0, 100.0)
    }

    pub fn is_complete(&self) -> bool {
        self.is_claimed || self.watched >= self.required()
    }

    pub fn remaining(&self) -> Duration {
        if self.is_complete() {
            return Duration::ZERO;
        }
        self.required().saturating_sub(self.watched)
    }

    /// Still worth watching for: not claimed, and either unfinished or
    /// finished but not yet handed to the claim path.
    pub fn needs_watching(&self) -> bool {
        !self.is_claimed && (!self.is_complete() || !self.completion_reported)
    }
}

/// A drop that just crossed 100%. Emitted at most once per arming.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedDrop {
    pub drop_id: String,
    pub drop_name: String,
    pub campaign_id: String,
    pub game_id: String,
}

/// Converts watched time into per-drop completion.
///
/// Progress only moves through [`accrue`](Self::accrue), which the scheduler
/// calls for the game it is actually watching.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    drops: HashMap<String, DropProgress>,
    order: Vec<String>,
    // Finished drops that fell out of the latest campaign snapshot.
    history: HashMap<String, DropProgress>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the tracked set with a fresh campaign snapshot.
    ///
    /// Known drops keep their tracked progress. For the game currently being
    /// watched the platform's figure is taken if it is ahead; other games never
    /// move here.
    pub fn sync_campaigns(&mut self, campaigns: &[DropCampaign], watched_game: Option<&str>) {
        let mut previous = std::mem::take(&mut self.drops);
        self.order.clear();

        for campaign in campaigns {
            for drop in &campaign.time_based_drops {
                let reported = MINUTE * drop.current_minutes_watched;
                let mut entry = match previous
                    .remove(&drop.id)
                    .or_else(|| self.history.remove(&drop.id))
                {
                    Some(mut known) => {
                        if watched_game == Some(campaign.game_id.as_str()) {
                            known.watched = known.watched.max(reported);
                        }
                        known
                    }
                    None => DropProgress {
                        drop_id: drop.id.clone(),
                        drop_name: String::new(),
                        campaign_id: String::new(),
                        campaign_name: String::new(),
                        game_id: String::new(),
                        game_name: String::new(),
                        required_minutes: 0,
                        is_claimed: false,
                        watched: reported,
                        completion_reported: false,
                    },
                };

                entry.drop_name = drop.name.clone();
                entry.campaign_id = campaign.id.clone();
                entry.campaign_name = campaign.name.clone();
                entry.game_id = campaign.game_id.clone();
                entry.game_name = campaign.game_name.clone();
                entry.required_minutes = drop.required_minutes_watched;
                if drop.is_claimed {
                    entry.is_claimed = true;
                }
                if entry.is_claimed {
                    entry.completion_reported = true;
                }

                if !self.drops.contains_key(&drop.id) {
                    self.order.push(drop.id.clone());
                }
                self.drops.insert(drop.id.clone(), entry);
            }
        }

        for (id, stale) in previous {
            if stale.is_complete() {
                self.history.insert(id, stale);
            }
        }
    }

    /// Credit `elapsed` watch time to every unfinished drop of `game_id`.
    pub fn accrue(&mut self, game_id: &str, elapsed: Duration) -> Vec<CompletedDrop> {
        let mut completed = Vec::new();

        for id in &self.order {
            let Some(entry) = self.drops.get_mut(id) else {
                continue;
            };
            if entry.game_id != game_id || entry.is_claimed {
                continue;
            }

            if !entry.is_complete() {
                entry.watched = (entry.watched + elapsed).min(entry.required());
            }

            if entry.is_complete() && !entry.completion_reported {
                entry.completion_reported = true;
                completed.push(CompletedDrop {
                    drop_id: entry.drop_id.clone(),
                    drop_name: entry.drop_name.clone(),
                    campaign_id: entry.campaign_id.clone(),
                    game_id: entry.game_id.clone(),
                });
            }
        }

        completed
    }

    /// Returns false if the drop was already claimed or is unknown.
    pub fn mark_claimed(&mut self, drop_id: &str) -> bool {
        let entry = self
            .drops
            .get_mut(drop_id)
            .or_else(|| self.history.get_mut(drop_id));
        match entry {
            Some(entry) if !entry.is_claimed => {
                entry.is_claimed = true;
                entry.completion_reported = true;
                true
            }
            _ => false,
        }
    }

    /// Let a finished but unclaimed drop be reported complete again.
    pub fn rearm(&mut self, drop_id: &str) {
        if let Some(entry) = self.drops.get_mut(drop_id) {
            if !entry.is_claimed {
                entry.completion_reported = false;
            }
        }
    }

    pub fn get(&self, drop_id: &str) -> Option<&DropProgress> {
        self.drops.get(drop_id)
    }

    /// Tracked drops in campaign order.
    pub fn iter(&self) -> impl Iterator<Item = &DropProgress> {
        self.order.iter().filter_map(|id| self.drops.get(id))
    }

    pub fn drops_for_game<'a>(&'a self, game_id: &'a str) -> impl Iterator<Item = &'a DropProgress> {
        self.iter().filter(move |entry| entry.game_id == game_id)
    }

    pub fn has_unfinished(&self, game_id: &str) -> bool {
        self.drops_for_game(game_id).any(DropProgress::needs_watching)
    }

    pub fn claimed_count(&self) -> usize {
        self.drops
            .values()
            .chain(self.history.values())
            .filter(|entry| entry.is_claimed)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::drops::TimeBasedDrop;
    use chrono::{Duration as ChronoDuration, Utc};

    fn campaign(id: &str, game_id: &str, drops: Vec<(&str, u32, u32)>) -> DropCampaign {
        let now = Utc::now();
        DropCampaign {
            id: id.into(),
            name: format!("campaign {}", id),
            game_id: game_id.into(),
            game_name: format!("game {}", game_id),
            start_at: now - ChronoDuration::days(1),
            end_at: now + ChronoDuration::days(1),
            time_based_drops: drops
                .into_iter()
                .map(|(drop_id, required, current)| TimeBasedDrop {
                    id: drop_id.into(),
                    name: format!("drop {}", drop_id),
                    required_minutes_watched: required,
                    current_minutes_watched: current,
                    is_claimed: false,
                    claim_id: Some(format!("claim-{}", drop_id)),
                })
                .collect(),
        }
    }

    #[test]
    fn accrues_only_for_the_watched_game() {
        let mut tracker = ProgressTracker::new();
        tracker.sync_campaigns(
            &[campaign("c1", "g1", vec![("d1", 10, 0)]), campaign("c2", "g2", vec![("d2", 10, 0)])],
            None,
        );

        tracker.accrue("g1", MINUTE * 5);

        assert_eq!(tracker.get("d1").unwrap().percentage(), 50.0);
        assert_eq!(tracker.get("d2").unwrap().percentage(), 0.0);
    }

    #[test]
    fn clamps_and_reports_completion_once() {
        let mut tracker = ProgressTracker::new();
        tracker.sync_campaigns(&[campaign("c1", "g1", vec![("d1", 10, 8)])], None);

        let first = tracker.accrue("g1", MINUTE * 5);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].drop_id, "d1");
        assert_eq!(tracker.get("d1").unwrap().percentage(), 100.0);

        let second = tracker.accrue("g1", MINUTE * 5);
        assert!(second.is_empty());
        assert!(!tracker.has_unfinished("g1"));
    }

    #[test]
    fn rearmed_drop_is_reported_again() {
        let mut tracker = ProgressTracker::new();
        tracker.sync_campaigns(&[campaign("c1", "g1", vec![("d1", 1, 0)])], None);
        assert_eq!(tracker.accrue("g1", MINUTE).len(), 1);

        tracker.rearm("d1");
        assert!(tracker.has_unfinished("g1"));
        assert_eq!(tracker.accrue("g1", Duration::ZERO).len(), 1);
    }

    #[test]
    fn refresh_never_moves_progress_of_unwatched_games() {
        let mut tracker = ProgressTracker::new();
        tracker.sync_campaigns(&[campaign("c1", "g1", vec![("d1", 60, 10)])], None);
        tracker.accrue("g1", MINUTE * 5);

        // The platform reports more progress for g1, but g2 is being watched.
        tracker.sync_campaigns(&[campaign("c1", "g1", vec![("d1", 60, 30)])], Some("g2"));
        assert_eq!(tracker.get("d1").unwrap().current_minutes(), 15);

        // While g1 is watched, the platform figure wins only when it is ahead.
        tracker.sync_campaigns(&[campaign("c1", "g1", vec![("d1", 60, 30)])], Some("g1"));
        assert_eq!(tracker.get("d1").unwrap().current_minutes(), 30);
        tracker.sync_campaigns(&[campaign("c1", "g1", vec![("d1", 60, 1)])], Some("g1"));
        assert_eq!(tracker.get("d1").unwrap().current_minutes(), 30);
    }

    #[test]
    fn completed_drops_survive_rotation_in_history() {
        let mut tracker = ProgressTracker::new();
        tracker.sync_campaigns(
            &[campaign("c1", "g1", vec![("d1", 1, 0), ("d2", 60, 0)])],
            None,
        );
        tracker.accrue("g1", MINUTE);
        assert!(tracker.mark_claimed("d1"));
        assert!(!tracker.mark_claimed("d1"));

        tracker.sync_campaigns(&[campaign("c3", "g3", vec![("d3", 30, 0)])], None);
        assert!(tracker.get("d1").is_none());
        assert!(tracker.get("d2").is_none());
        assert_eq!(tracker.claimed_count(), 1);

        // Reappearing drops pick their history back up.
        tracker.sync_campaigns(&[campaign("c1", "g1", vec![("d1", 1, 0)])], None);
        assert!(tracker.get("d1").unwrap().is_claimed);
    }

    #[test]
    fn zero_minute_drops_are_complete() {
        let mut tracker = ProgressTracker::new();
        tracker.sync_campaigns(&[campaign("c1", "g1", vec![("d1", 0, 0)])], None);
        assert_eq!(tracker.get("d1").unwrap().percentage(), 100.0);
        assert_eq!(tracker.accrue("g1", Duration::ZERO).len(), 1);
    }
}
