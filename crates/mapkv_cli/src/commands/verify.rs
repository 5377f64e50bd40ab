//! Verify command implementation.

use super::{CliResult, Target};
use mapkv_core::{list_stems, verify_file, StorePaths, VerifyReport};
use serde::Serialize;

/// Verification result for one store file.
#[derive(Debug, Serialize)]
pub struct VerifyResult {
    /// File stem.
    pub stem: String,
    /// Whether a header slot validated.
    pub header_ok: bool,
    /// Whether the log fits the file.
    pub length_ok: bool,
    /// Whether the content checksum matched.
    pub content_crc_ok: bool,
    /// Records that decoded; absent for encrypted files without a key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub records: Option<usize>,
    /// Live keys; absent for encrypted files without a key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub live_keys: Option<usize>,
    /// Overall verdict.
    pub ok: bool,
}

impl VerifyResult {
    fn from_report(stem: &str, report: &VerifyReport) -> Self {
        Self {
            stem: stem.to_string(),
            header_ok: report.header.is_some(),
            length_ok: report.length_ok,
            content_crc_ok: report.content_crc_ok,
            records: report.records,
            live_keys: report.live_keys,
            ok: report.is_valid(),
        }
    }
}

/// Runs the verify command on `id`, or on every store when `id` is `None`.
pub fn run(target: &Target<'_>, id: Option<&str>, format: &str) -> CliResult<()> {
    let stems = match id {
        Some(id) => vec![StorePaths::for_id(target.root, id)?.stem().to_string()],
        None => list_stems(target.root)?,
    };
    let key = target.key()?;

    let mut results = Vec::with_capacity(stems.len());
    for stem in &stems {
        let path = StorePaths::for_stem(target.root, stem.as_str()).data_path();
        let report = verify_file(&path, key.as_ref())?;
        results.push(VerifyResult::from_report(stem, &report));
    }

    let failed = results.iter().filter(|r| !r.ok).count();
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&results)?),
        _ => {
            for result in &results {
                print_result(result);
            }
            println!();
            if failed == 0 {
                println!("✓ {} store(s) verified", results.len());
            } else {
                println!("✗ {failed} of {} store(s) failed verification", results.len());
            }
        }
    }

    if failed == 0 {
        Ok(())
    } else {
        Err("Verification failed".into())
    }
}

fn print_result(result: &VerifyResult) {
    let mark = |ok: bool| if ok { "ok" } else { "FAILED" };
    println!("{}:", result.stem);
    println!("  header:   {}", mark(result.header_ok));
    println!("  length:   {}", mark(result.length_ok));
    println!("  checksum: {}", mark(result.content_crc_ok));
    match (result.records, result.live_keys) {
        (Some(records), Some(keys)) => println!("  records:  {records} ({keys} live keys)"),
        _ => println!("  records:  not checked (encrypted, no key given)"),
    }
}
