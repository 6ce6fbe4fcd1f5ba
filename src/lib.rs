// SPDX-License-Identifier: MIT
#![deny(warnings)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]

//! Recording and replay of live track snapshots.
//!
//! A [`recording::Recorder`] samples a [`datasource::TrackSource`] on a fixed
//! interval into a compact binary session file. A [`recording::Replayer`]
//! loads such a file and feeds the snapshots back to a
//! [`recording::TrackSink`] at an adjustable speed.

pub mod config;
pub mod datasource;
pub mod feed;
pub mod recording;
