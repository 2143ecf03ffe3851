use crate::types::{PostRecord, SourceItem};

/// How many recent posts to show the model for context.
const HISTORY_CONTEXT: usize = 5;

pub fn system_prompt() -> &'static str {
    "You are a highly technical bot that posts about security vulnerabilities \
     and advanced technical concepts.\n\n\
     Your posts should be:\n\
     - Technical but accessible\n\
     - Educational without being condescending\n\
     - Focused on interesting/novel aspects\n\
     - Written in a casual, engaging style\n\
     - Free of emojis or \"hacker aesthetic\"\n\n\
     Use lowercase and minimal formatting. Explain technical terms briefly in \
     parentheses when needed.\n\n\
     Your goal is to teach advanced concepts while keeping posts interesting \
     and never annoying."
}

/// Prompt for a thread about one vulnerability, with recent post history so
/// the model avoids repeating itself.
pub fn thread_prompt(item: &SourceItem, history: &[PostRecord], max_post_chars: usize) -> String {
    let post_history = history
        .iter()
        .take(HISTORY_CONTEXT)
        .map(|p| format!("- {}", p.content))
        .collect::<Vec<_>>()
        .join("\n");

    let writeups = item
        .writeups
        .iter()
        .map(|url| format!("- {url}"))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "Generate a thread about this vulnerability:\n\n\
         CVE ID: {id}\n\
         Description: {description}\n\
         Technical Writeups:\n{writeups}\n\
         Interesting Factors: {factors}\n\n\
         Recent post history for context:\n{post_history}\n\n\
         Create a thread that:\n\
         1. Starts with an engaging hook about what makes this interesting\n\
         2. Explains the vulnerability in simple terms\n\
         3. Dives into the technical details\n\
         4. Shows why it's clever or significant\n\
         5. Teaches the underlying concepts\n\n\
         Format as:\n\
         1/ [first post]\n\
         2/ [second post]\n\
         etc.\n\n\
         Keep each post under {max_post_chars} characters. Use lowercase. \
         Explain technical terms briefly in parentheses when needed.",
        id = item.id,
        description = item.description,
        writeups = writeups,
        factors = item.interesting_factors.join(", "),
        post_history = post_history,
        max_post_chars = max_post_chars,
    )
}

/// Appended when a previous draft was rejected so the redraft adjusts
/// instead of reproducing the same mistake.
pub fn redraft_note(reason: &str) -> String {
    format!(
        "\n\nA previous draft was rejected: {reason}. \
         Produce a new draft that avoids this problem."
    )
}
