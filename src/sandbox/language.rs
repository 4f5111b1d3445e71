use std::collections::HashMap;

use serde::Deserialize;

/// How to build and start a program written in one language
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct LanguageProfile {
    pub source_file: String,
    #[serde(default)]
    pub compile_command: Option<Vec<String>>,
    pub run_command: Vec<String>,
    #[serde(default)]
    pub needs_compile: bool,
}

impl LanguageProfile {
    fn new(source_file: &str, compile: Option<&[&str]>, run: &[&str]) -> Self {
        let owned = |args: &[&str]| args.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        Self {
            source_file: source_file.to_string(),
            needs_compile: compile.is_some(),
            compile_command: compile.map(owned),
            run_command: owned(run),
        }
    }

    /// The compile command, if this profile has one to run
    pub fn compile_step(&self) -> Option<&[String]> {
        match &self.compile_command {
            Some(cmd) if self.needs_compile && !cmd.is_empty() => Some(cmd),
            _ => None,
        }
    }
}

/// A named entry as it appears in the configuration file
#[derive(Deserialize, Debug, Clone)]
pub struct LanguageConfig {
    pub name: String,
    #[serde(flatten)]
    pub profile: LanguageProfile,
}

/// Language id to profile mapping, read-only once judging starts
#[derive(Debug, Clone, Default)]
pub struct LanguageTable {
    profiles: HashMap<String, LanguageProfile>,
}

impl LanguageTable {
    pub fn empty() -> Self {
        Self::default()
    }

    /// The languages every deployment supports out of the box
    pub fn builtin() -> Self {
        let mut table = Self::empty();
        table.insert(
            "c",
            LanguageProfile::new(
                "main.c",
                Some(&["gcc", "-o", "main", "main.c", "-O2", "-Wall", "-lm", "-std=c11"]),
                &["./main"],
            ),
        );
        table.insert(
            "cpp",
            LanguageProfile::new(
                "main.cpp",
                Some(&["g++", "-o", "main", "main.cpp", "-O2", "-Wall", "-std=c++17"]),
                &["./main"],
            ),
        );
        table.insert(
            "python",
            LanguageProfile::new("main.py", None, &["python3", "main.py"]),
        );
        table.insert(
            "java",
            LanguageProfile::new("Main.java", Some(&["javac", "Main.java"]), &["java", "Main"]),
        );
        table.insert(
            "go",
            LanguageProfile::new(
                "main.go",
                Some(&["go", "build", "-o", "main", "main.go"]),
                &["./main"],
            ),
        );
        table
    }

    /// Adds or replaces a profile. Ids are case-insensitive.
    pub fn insert(&mut self, name: &str, profile: LanguageProfile) {
        self.profiles.insert(name.to_lowercase(), profile);
    }

    pub fn extend(&mut self, configs: impl IntoIterator<Item = LanguageConfig>) {
        for config in configs {
            log::debug!("Registering language profile `{}`", config.name);
            self.insert(&config.name, config.profile);
        }
    }

    pub fn get(&self, name: &str) -> Option<&LanguageProfile> {
        self.profiles.get(&name.to_lowercase())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.profiles.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_profiles() {
        let table = LanguageTable::builtin();
        assert_eq!(table.names(), vec!["c", "cpp", "go", "java", "python"]);

        let python = table.get("python").unwrap();
        assert!(!python.needs_compile);
        assert_eq!(python.compile_step(), None);
        assert_eq!(python.run_command, vec!["python3", "main.py"]);

        let java = table.get("Java").unwrap();
        assert!(java.needs_compile);
        assert_eq!(java.source_file, "Main.java");
        assert_eq!(java.compile_step().unwrap()[0], "javac");

        assert!(!table.contains("brainfuck"));
    }

    #[test]
    fn test_configured_language_overrides_builtin() {
        let configs: Vec<LanguageConfig> = serde_json::from_str(
            r#"[
                {"name": "sh", "source_file": "main.sh",
                 "compile_command": ["sh", "-n", "main.sh"],
                 "run_command": ["sh", "main.sh"], "needs_compile": true},
                {"name": "python", "source_file": "solution.py",
                 "run_command": ["pypy3", "solution.py"]}
            ]"#,
        )
        .unwrap();

        let mut table = LanguageTable::builtin();
        table.extend(configs);

        assert_eq!(table.get("sh").unwrap().compile_step().unwrap().len(), 3);
        assert_eq!(table.get("python").unwrap().run_command[0], "pypy3");
        assert_eq!(table.names().len(), 6);
    }

    #[test]
    fn test_compile_step_requires_flag_and_command() {
        let mut profile = LanguageProfile::new("main.c", Some(&["gcc", "main.c"]), &["./a.out"]);
        profile.needs_compile = false;
        assert_eq!(profile.compile_step(), None);

        profile.needs_compile = true;
        profile.compile_command = Some(Vec::new());
        assert_eq!(profile.compile_step(), None);
    }
}
