//! # Audio Module
//!
//! Per-guild playback orchestration for the jukebox.
//!
//! Every guild owns an independent session: a queue of user tracks with an
//! optional trailing autoplay suggestion, a playback driver and a voice
//! connection. Guilds never block each other.
//!
//! ## Architecture
//!
//! ### [`player`] - Playback Driver
//! - State machine `Idle → Loading → Playing → Loading…` per guild
//! - Cache-first loading with a remote stream fallback
//! - Bounded retry with backoff, then skip and notify
//! - Idle sweep and single-shot stop
//!
//! ### [`queue`] - Queue Management
//! - User tracks always ahead of the suggestion
//! - Bounded history of played tracks
//!
//! ### [`autoplay`] - Suggestions
//! - One related track kept at the tail while autoplay is on
//! - Single-flight fetches with a dirty flag for coalesced re-runs
//!
//! ### [`transport`] / [`voice`] - Voice Seams
//! - Traits the driver talks to, and their Songbird implementation
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! let (player, events) = AudioPlayer::new(deps, PlayerConfig::default());
//! player.spawn_event_loop(events);
//!
//! player.connect(guild_id, channel_id, &connector).await?;
//! player.enqueue(guild_id, tracks, Some(text_channel)).await?;
//! player.control(guild_id, ControlAction::Skip).await?;
//! ```

pub mod autoplay;
pub mod flight;
pub mod player;
pub mod queue;
pub mod state;
pub mod track;
pub mod transport;
pub mod voice;
