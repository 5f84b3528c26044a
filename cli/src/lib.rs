//! Kiln CLI - build, run, and rebase app images from source.

pub mod commands;
