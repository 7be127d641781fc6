use crate::cli::args::{CacheArgs, CacheSub};
use crate::exit_codes::{NOT_FOUND, OK};
use prism_core::cache::ColumnCache;
use prism_core::load_config;

pub fn run(args: CacheArgs) -> anyhow::Result<i32> {
    let cfg = load_config(&args.config)?;
    let cache = ColumnCache::new(&cfg.cache_path);
    match args.cmd {
        CacheSub::List { json } => list(&cache, json),
        CacheSub::Clear { all } => {
            let removed = cache.clear(all)?;
            println!("removed {} file(s) from {}", removed, cache.dir().display());
            Ok(OK)
        }
        CacheSub::Inspect { column } => inspect(&cache, &column),
    }
}

fn list(cache: &ColumnCache, json: bool) -> anyhow::Result<i32> {
    let entries = cache.list()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(OK);
    }
    if entries.is_empty() {
        println!("cache at {} is empty", cache.dir().display());
        return Ok(OK);
    }
    println!("{:<48} {:>8} {:>8}", "COLUMN", "ROWS", "MISSING");
    for e in &entries {
        println!("{:<48} {:>8} {:>8}", e.column.canonical(), e.rows, e.missing);
    }
    Ok(OK)
}

fn inspect(cache: &ColumnCache, name: &str) -> anyhow::Result<i32> {
    let Some(entry) = cache
        .list()?
        .into_iter()
        .find(|e| e.column.canonical() == name)
    else {
        eprintln!("no cached column named '{}'", name);
        return Ok(NOT_FOUND);
    };
    match cache.read(&entry.column)? {
        Some(series) => {
            println!("{}", serde_json::to_string_pretty(&series)?);
            Ok(OK)
        }
        None => {
            eprintln!("column '{}' could not be decoded", name);
            Ok(NOT_FOUND)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prism_core::column::ColumnIdentity;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn project() -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("prism.yaml");
        std::fs::write(&config, "version: 1\ncache_path: cache\n").unwrap();
        (dir, config)
    }

    #[test]
    fn clear_then_inspect_reports_not_found() {
        let (dir, config) = project();
        let cache = ColumnCache::new(dir.path().join("cache"));
        let column = ColumnIdentity::predistill("len");
        cache
            .persist_series(&column, BTreeMap::from([("0".to_string(), json!(3))]))
            .unwrap();

        let inspect_args = |c: String| CacheArgs {
            config: config.clone(),
            cmd: CacheSub::Inspect { column: c },
        };
        assert_eq!(run(inspect_args(column.canonical())).unwrap(), OK);
        let cleared = CacheArgs {
            config: config.clone(),
            cmd: CacheSub::Clear { all: false },
        };
        assert_eq!(run(cleared).unwrap(), OK);
        assert_eq!(run(inspect_args(column.canonical())).unwrap(), NOT_FOUND);
    }
}
