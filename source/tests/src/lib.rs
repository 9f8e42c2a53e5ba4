//! End-to-end scenarios for the stratum engine, driven through the service
//! facade over real temporary directory trees.

#[cfg(test)]
mod common;

#[cfg(test)]
mod resolve_scenarios;

#[cfg(test)]
mod update_and_versions;

#[cfg(test)]
mod watch_and_trace;
