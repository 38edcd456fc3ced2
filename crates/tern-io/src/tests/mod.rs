//! Tests for the tern-io engine.

mod helpers;
