use crate::cli::args::{AlignArgs, AnnotateArgs};
use crate::exit_codes::{NOT_FOUND, OK};
use prism_core::prompts::align::{annotate_prompt, find_best_match, Anchor};
use serde_json::json;

pub fn run_align(args: AlignArgs) -> anyhow::Result<i32> {
    let Some(m) = find_best_match(&args.prompt, &args.snippet) else {
        eprintln!("no match for snippet");
        return Ok(NOT_FOUND);
    };
    if args.json {
        let out = json!({
            "text": m.text,
            "start": m.start,
            "end": m.end,
            "ratio": m.ratio,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!("{:.3}\t{}..{}\t{}", m.ratio, m.start, m.end, m.text);
    }
    Ok(OK)
}

pub fn run_annotate(args: AnnotateArgs) -> anyhow::Result<i32> {
    let ids: Vec<String> = (0..args.snippets.len()).map(|i| i.to_string()).collect();
    let anchors: Vec<Anchor<'_>> = args
        .snippets
        .iter()
        .zip(&ids)
        .map(|((name, snippet), id)| Anchor {
            id: id.as_str(),
            name: name.as_str(),
            snippet: snippet.as_str(),
        })
        .collect();
    println!("{}", annotate_prompt(&args.prompt, &anchors));
    Ok(OK)
}
