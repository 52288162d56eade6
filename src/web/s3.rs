// src/web/s3.rs

//! `s3://` mirrors through the `aws` command line tool
//!
//! Credentials, regions and endpoints come from the usual AWS environment
//! and profile files.

use super::{BlobStore, ObjectStat};
use crate::error::{Error, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use std::path::Path;
use std::process::{Command, Output};
use tracing::debug;

pub struct S3Store;

/// Split `s3://bucket/key` into bucket and key
pub fn split_url(url: &str) -> Result<(&str, &str)> {
    let rest = url
        .strip_prefix("s3://")
        .ok_or_else(|| Error::Web(format!("not an s3 URL: {}", url)))?;
    Ok(rest.split_once('/').unwrap_or((rest, "")))
}

fn aws(args: &[&str]) -> Result<Output> {
    let exe = which::which("aws")
        .map_err(|e| Error::Web(format!("s3 mirrors need the aws command line tool: {}", e)))?;
    debug!("aws {}", args.join(" "));
    Command::new(exe)
        .args(args)
        .output()
        .map_err(|e| Error::Web(format!("failed to run aws: {}", e)))
}

fn failure(url: &str, output: &Output) -> Error {
    let stderr = String::from_utf8_lossy(&output.stderr);
    if stderr.contains("404") || stderr.contains("NoSuchKey") || stderr.contains("Not Found") {
        Error::NotFound(url.to_string())
    } else {
        Error::Web(format!("{}: {}", url, stderr.trim()))
    }
}

/// Parse one line of `aws s3 ls` output into (mtime, size, name)
fn parse_ls_line(line: &str) -> Option<(NaiveDateTime, u64, &str)> {
    let mut fields = line.splitn(4, char::is_whitespace).filter(|f| !f.is_empty());
    let date = fields.next()?;
    let time = fields.next()?;
    let rest = line.get(date.len() + time.len() + 2..)?.trim_start();
    let (size, name) = rest.split_once(char::is_whitespace)?;
    let mtime = NaiveDateTime::parse_from_str(&format!("{} {}", date, time), "%Y-%m-%d %H:%M:%S").ok()?;
    Some((mtime, size.parse().ok()?, name.trim_start()))
}

/// Objects deleted per `aws s3 rm` call
const RM_BATCH: usize = 256;

/// Arguments deleting exactly `keys` under `prefix_url`
fn remove_keys_args(prefix_url: &str, keys: &[&str]) -> Vec<String> {
    // No --quiet: the "delete: URL" lines are how deletions are counted
    let mut args: Vec<String> = vec![
        "s3".to_string(),
        "rm".to_string(),
        "--recursive".to_string(),
        format!("{}/", prefix_url.trim_end_matches('/')),
    ];
    args.extend(["--exclude".to_string(), "*".to_string()]);
    for key in keys {
        args.extend(["--include".to_string(), key.to_string()]);
    }
    args
}

/// Delete the named keys below `prefix_url`, a batch per `aws` call
///
/// Only keys in `keys` can match the filters, so objects uploaded by
/// someone else in the meantime are never touched. Keys containing glob
/// characters are skipped; the caller deletes them one by one. Returns the
/// URLs aws reported as deleted.
pub fn aws_remove_keys(prefix_url: &str, keys: &[&str]) -> Result<Vec<String>> {
    let literal: Vec<&str> = keys
        .iter()
        .copied()
        .filter(|k| !k.contains(['*', '?', '[', ']']))
        .collect();
    let mut deleted = Vec::new();
    for batch in literal.chunks(RM_BATCH) {
        let args = remove_keys_args(prefix_url, batch);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = aws(&args)?;
        if !output.status.success() {
            return Err(failure(prefix_url, &output));
        }
        deleted.extend(
            String::from_utf8_lossy(&output.stdout)
                .lines()
                .filter_map(|line| line.trim().strip_prefix("delete: "))
                .map(str::to_string),
        );
    }
    Ok(deleted)
}

impl BlobStore for S3Store {
    fn read_from_url(&self, url: &str) -> Result<Vec<u8>> {
        let output = aws(&["s3", "cp", "--quiet", url, "-"])?;
        if !output.status.success() {
            return Err(failure(url, &output));
        }
        Ok(output.stdout)
    }

    fn push_to_url(&self, local: &Path, url: &str) -> Result<()> {
        let local = local.to_string_lossy();
        let output = aws(&["s3", "cp", "--quiet", &local, url])?;
        if !output.status.success() {
            return Err(failure(url, &output));
        }
        Ok(())
    }

    fn remove_url(&self, url: &str, recursive: bool) -> Result<()> {
        let mut args = vec!["s3", "rm", "--quiet", url];
        if recursive {
            args.push("--recursive");
        }
        let output = aws(&args)?;
        if !output.status.success() {
            return Err(failure(url, &output));
        }
        Ok(())
    }

    fn list_url(&self, url: &str, recursive: bool) -> Result<Vec<String>> {
        let prefix_url = format!("{}/", url.trim_end_matches('/'));
        let mut args = vec!["s3", "ls", prefix_url.as_str()];
        if recursive {
            args.push("--recursive");
        }
        let output = aws(&args)?;
        // `aws s3 ls` exits 1 for an empty prefix
        if !output.status.success() && !output.stdout.is_empty() {
            return Err(failure(url, &output));
        }

        let (_, key_prefix) = split_url(&prefix_url)?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut out: Vec<String> = stdout
            .lines()
            .filter(|line| !line.trim_start().starts_with("PRE "))
            .filter_map(parse_ls_line)
            .map(|(_, _, name)| {
                // Recursive listings print full keys
                if recursive {
                    name.strip_prefix(key_prefix).unwrap_or(name).to_string()
                } else {
                    name.to_string()
                }
            })
            .collect();
        out.sort();
        Ok(out)
    }

    fn stat_url(&self, url: &str) -> Result<Option<ObjectStat>> {
        let (bucket, key) = split_url(url)?;
        let output = aws(&["s3api", "head-object", "--bucket", bucket, "--key", key])?;
        if !output.status.success() {
            return match failure(url, &output) {
                Error::NotFound(_) => Ok(None),
                e => Err(e),
            };
        }
        let head: serde_json::Value = serde_json::from_slice(&output.stdout)?;
        let size = head["ContentLength"].as_u64().unwrap_or(0);
        let mtime = head["LastModified"]
            .as_str()
            .and_then(|s| {
                DateTime::parse_from_rfc3339(s)
                    .or_else(|_| DateTime::parse_from_rfc2822(s))
                    .ok()
            })
            .map(|t| t.with_timezone(&Utc))
            .ok_or_else(|| Error::Web(format!("{}: no LastModified in head-object", url)))?;
        Ok(Some(ObjectStat { size, mtime }))
    }
}
