use anyhow::{anyhow, Result};
use regex::Regex;
use std::env;

/// Expands `${VAR}` and `${VAR:-default}` references in a config document.
pub fn expand_env(input: &str) -> Result<String> {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-(.*?))?\}")?;
    let mut out = String::with_capacity(input.len());
    let mut last = 0;
    for caps in re.captures_iter(input) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            return Err(anyhow!("envsubst capture error"));
        };
        out.push_str(&input[last..whole.start()]);
        let value = match (env::var(name.as_str()), caps.get(2)) {
            (Ok(v), _) => v,
            (Err(_), Some(default)) => default.as_str().to_string(),
            (Err(_), None) => {
                return Err(anyhow!("missing environment variable: {}", name.as_str()))
            }
        };
        out.push_str(&value);
        last = whole.end();
    }
    out.push_str(&input[last..]);
    Ok(out)
}
