use std::io::{self, BufRead, Write};

/// Prints `label` and reads one trimmed line. `None` on end of input.
pub fn line(label: &str) -> io::Result<Option<String>> {
    print!("{label}");
    io::stdout().flush()?;
    let mut buf = String::new();
    if io::stdin().lock().read_line(&mut buf)? == 0 {
        return Ok(None);
    }
    Ok(Some(buf.trim().to_string()))
}

pub fn parse_yes_no(input: &str) -> Option<bool> {
    match input.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => Some(true),
        "n" | "no" => Some(false),
        _ => None,
    }
}

/// Resolves a pick list such as `1, 3 ISIC_0024306` against the shown case
/// ids. Numbers are 1-based positions; anything else must be an id.
pub fn parse_picks(input: &str, case_ids: &[String]) -> Result<Vec<String>, String> {
    let mut picks = Vec::new();
    for token in input
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|t| !t.is_empty())
    {
        let id = match token.parse::<usize>() {
            Ok(n) if (1..=case_ids.len()).contains(&n) => case_ids[n - 1].clone(),
            Ok(n) => return Err(format!("{n} is not a listed case number")),
            Err(_) if case_ids.iter().any(|id| id == token) => token.to_string(),
            Err(_) => return Err(format!("unknown case '{token}'")),
        };
        if !picks.contains(&id) {
            picks.push(id);
        }
    }
    Ok(picks)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids() -> Vec<String> {
        ["ISIC_1", "ISIC_2", "ISIC_3", "ISIC_4"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    #[test]
    fn yes_no_accepts_short_and_long_forms() {
        assert_eq!(parse_yes_no("Y"), Some(true));
        assert_eq!(parse_yes_no(" no "), Some(false));
        assert_eq!(parse_yes_no("maybe"), None);
    }

    #[test]
    fn picks_mix_positions_and_ids() {
        assert_eq!(
            parse_picks("1, ISIC_3 2", &ids()).unwrap(),
            vec!["ISIC_1", "ISIC_3", "ISIC_2"]
        );
        assert_eq!(parse_picks("2 2", &ids()).unwrap(), vec!["ISIC_2"]);
        assert!(parse_picks("", &ids()).unwrap().is_empty());
    }

    #[test]
    fn picks_reject_unknown_entries() {
        assert!(parse_picks("5", &ids()).is_err());
        assert!(parse_picks("0", &ids()).is_err());
        assert!(parse_picks("ISIC_9", &ids()).is_err());
    }
}
