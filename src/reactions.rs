use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// Horizontal placement range, in percent of the stage width.
const OFFSET_MIN: f32 = 10.0;
const OFFSET_MAX: f32 = 80.0;

/// Presentation data for a reaction kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReactionStyle {
    pub kind: u8,
    pub symbol: &'static str,
    pub label: &'static str,
}

const CATALOGUE: [ReactionStyle; 5] = [
    ReactionStyle { kind: 1, symbol: "\u{2764}\u{fe0f}", label: "Love" },
    ReactionStyle { kind: 2, symbol: "\u{1f44d}", label: "Like" },
    ReactionStyle { kind: 3, symbol: "\u{1f60d}", label: "Adore" },
    ReactionStyle { kind: 4, symbol: "\u{1f525}", label: "Fire" },
    ReactionStyle { kind: 5, symbol: "\u{1f44f}", label: "Applause" },
];

pub fn reaction_style(kind: u8) -> Option<ReactionStyle> {
    CATALOGUE.iter().copied().find(|s| s.kind == kind)
}

/// A reaction currently floating on screen.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveReaction {
    pub key: String,
    pub style: ReactionStyle,
    pub offset_percent: f32,
    #[serde(skip)]
    pub spawned_at: Instant,
}

/// Turns reaction signals into short-lived entries. Each spawn schedules its
/// own expiry, which is delivered on `expiry_tx` as the reaction key; the
/// owner then calls [`ReactionScheduler::expire`].
pub struct ReactionScheduler {
    ttl: Duration,
    active: Vec<ActiveReaction>,
    expiry_tx: mpsc::UnboundedSender<String>,
}

impl ReactionScheduler {
    pub fn new(ttl: Duration, expiry_tx: mpsc::UnboundedSender<String>) -> Self {
        Self {
            ttl,
            active: Vec::new(),
            expiry_tx,
        }
    }

    /// Unknown kinds come from untrusted peers, so they are logged and ignored.
    pub fn spawn(&mut self, kind: u8) -> Option<ActiveReaction> {
        let Some(style) = reaction_style(kind) else {
            warn!("Ignoring reaction with unknown kind {}", kind);
            return None;
        };

        let spawned_at = Instant::now();
        let reaction = ActiveReaction {
            key: Uuid::new_v4().to_string(),
            style,
            offset_percent: rand::thread_rng().gen_range(OFFSET_MIN..OFFSET_MAX),
            spawned_at,
        };
        self.active.push(reaction.clone());

        let tx = self.expiry_tx.clone();
        let key = reaction.key.clone();
        let deadline = spawned_at + self.ttl;
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let _ = tx.send(key);
        });

        debug!("Spawned reaction {} ({})", reaction.key, style.label);
        Some(reaction)
    }

    /// Removes the reaction with `key`; returns whether it was present.
    pub fn expire(&mut self, key: &str) -> bool {
        let before = self.active.len();
        self.active.retain(|r| r.key != key);
        self.active.len() != before
    }

    pub fn active(&self) -> &[ActiveReaction] {
        &self.active
    }

    pub fn clear(&mut self) {
        self.active.clear();
    }
}
