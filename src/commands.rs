/// Available commands and autocomplete logic

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
  pub name: &'static str,
  pub aliases: &'static [&'static str],
  pub description: &'static str,
}

/// All available commands
pub const COMMANDS: &[Command] = &[
  Command {
    name: "refresh",
    aliases: &["r", "poll"],
    description: "Check the remote for changes now",
  },
  Command {
    name: "reload",
    aliases: &["rl", "force"],
    description: "Reload everything, ignoring cached freshness tokens",
  },
  Command {
    name: "status",
    aliases: &["s", "st", "info"],
    description: "Show collection sizes and sync state",
  },
  Command {
    name: "issues",
    aliases: &["ls", "list"],
    description: "List issues, only those carrying LABEL when given",
  },
  Command {
    name: "show",
    aliases: &["v", "view"],
    description: "Show one issue (NUMBER)",
  },
  Command {
    name: "new",
    aliases: &["n", "create"],
    description: "Open an issue: new [#NUMBER] TITLE, inheriting labels of #NUMBER",
  },
  Command {
    name: "label",
    aliases: &["l", "lbl"],
    description: "label add NAME [COLOR] | label rm NAME",
  },
  Command {
    name: "milestone",
    aliases: &["m", "ms"],
    description: "milestone add TITLE | milestone rm TITLE",
  },
  Command {
    name: "watch",
    aliases: &["w"],
    description: "Toggle change notifications, or print only those of KIND",
  },
  Command {
    name: "project",
    aliases: &["p", "switch"],
    description: "Switch to another repository (OWNER/REPO)",
  },
  Command {
    name: "comments",
    aliases: &["c", "comment"],
    description: "Show the comments of an issue (NUMBER)",
  },
  Command {
    name: "help",
    aliases: &["h", "?"],
    description: "List commands",
  },
  Command {
    name: "quit",
    aliases: &["q", "exit"],
    description: "Exit hubsync",
  },
];

/// Get autocomplete suggestions for a given input
pub fn get_suggestions(input: &str) -> Vec<&'static Command> {
  let input_lower = input.to_lowercase();

  if input_lower.is_empty() {
    return COMMANDS.iter().collect();
  }

  let mut matches: Vec<(&Command, u32)> = Vec::new();

  for cmd in COMMANDS {
    // Exact match on name
    if cmd.name == input_lower {
      matches.push((cmd, 0)); // Highest priority
      continue;
    }

    // Exact match on alias
    if cmd.aliases.contains(&input_lower.as_str()) {
      matches.push((cmd, 1));
      continue;
    }

    // Prefix match on name
    if cmd.name.starts_with(&input_lower) {
      matches.push((cmd, 2));
      continue;
    }

    // Prefix match on alias
    if cmd.aliases.iter().any(|a| a.starts_with(&input_lower)) {
      matches.push((cmd, 3));
    }
  }

  // Sort by priority
  matches.sort_by_key(|(_, priority)| *priority);

  matches.into_iter().map(|(cmd, _)| cmd).collect()
}

/// Split an input line into its best-matching command and the remaining argument.
pub fn resolve(line: &str) -> Option<(&'static Command, &str)> {
  let line = line.trim();
  let (word, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
  if word.is_empty() {
    return None;
  }
  get_suggestions(word)
    .first()
    .map(|cmd| (*cmd, rest.trim()))
}
