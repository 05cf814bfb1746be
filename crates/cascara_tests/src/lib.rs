//! End-to-end scenarios for the cascara engine live in `tests/`; this
//! crate exists to give them a home in the workspace.
