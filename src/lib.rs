//! Tails a directory of rotating XML-fragment logs and forwards reassembled records.
//!
//! A [`watcher::DirectoryWatcher`] feeds newly created log files into a
//! [`queue::PendingFileQueue`]; a [`tailer::LogTailer`] consumes them one at a time, rebuilds
//! records with [`assembler::RecordAssembler`] and hands them to a [`consumer::LogConsumer`].
//! [`pipeline::Pipeline`] wires the pieces together.

pub mod assembler;
pub mod config;
pub mod consumer;
pub mod deserializer;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod queue;
pub mod record;
pub mod sanitizer;
pub mod tailer;
pub mod watcher;
