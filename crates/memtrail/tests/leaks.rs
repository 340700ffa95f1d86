#[cfg(test)]
pub mod tests {
    use std::process::{Command, Output};

    fn run_example(example: &str, features: Option<&str>) -> Output {
        run_example_with_env(example, features, &[])
    }

    fn run_example_with_env(
        example: &str,
        features: Option<&str>,
        envs: &[(&str, &str)],
    ) -> Output {
        let mut args = vec!["run", "-p", "test-leaks", "--example", example];
        if let Some(features) = features {
            args.extend(["--features", features]);
        }

        let output = Command::new("cargo")
            .args(&args)
            .env("NO_COLOR", "1")
            .env_remove("MEMTRAIL_FORMAT")
            .env_remove("MEMTRAIL_QUIET")
            .env_remove("MEMTRAIL_CALLER_FRAMES")
            .env_remove("MEMTRAIL_SYMBOLIZER")
            .envs(envs.iter().copied())
            .output()
            .expect("Failed to execute command");

        assert!(
            output.status.success(),
            "Process did not exit successfully.\n\nstderr:\n{}",
            String::from_utf8_lossy(&output.stderr)
        );
        output
    }

    fn addr2line_available() -> bool {
        cfg!(target_os = "linux")
            && Command::new("addr2line")
                .arg("--version")
                .output()
                .is_ok_and(|output| output.status.success())
    }

    fn assert_contains_all(haystack: &str, expected: &[&str]) {
        for expected in expected {
            assert!(
                haystack.contains(expected),
                "Expected:\n{expected}\n\nGot:\n{haystack}",
            );
        }
    }

    // cargo run -p test-leaks --example scenario
    #[test]
    fn test_scenario_output() {
        let output = run_example("scenario", None);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);

        assert_contains_all(
            &stderr,
            &[
                "├ alloc",
                "├ free",
                "alloc size :   16",
                "alloc size :   32",
                "freed size :   16",
                "Total memory :   48",
                "Invalid or double free detected",
                "Memory leaks detected:",
                "Total leaks: 1",
                "Total memory leaked: 32 bytes",
                "bytes (id: 2)",
            ],
        );
        assert_eq!(stderr.matches("Invalid or double free detected").count(), 1);
        assert!(!stderr.contains("(id: 1)"), "Got:\n{stderr}");
        assert!(stdout.contains(&"-".repeat(96)), "Got:\n{stdout}");

        if addr2line_available() {
            assert_contains_all(&stderr, &["load_header", "load_body", "discard"]);
        }
    }

    // cargo run -p test-leaks --example no_leaks
    #[test]
    fn test_no_leaks_output() {
        let output = run_example("no_leaks", None);
        let stderr = String::from_utf8_lossy(&output.stderr);

        assert_contains_all(&stderr, &["├ alloc", "├ free", "No memory leaks detected"]);
        assert_eq!(stderr.matches("├ alloc").count(), 6);
        assert_eq!(stderr.matches("├ free").count(), 6);
        assert!(!stderr.contains("Memory leaks detected"));
        assert!(!stderr.contains("Invalid or double free"));
    }

    // cargo run -p test-leaks --example scene
    #[test]
    fn test_scene_table_output() {
        let output = run_example("scene", None);
        let stderr = String::from_utf8_lossy(&output.stderr);

        // one texture path was overwritten before cleanup
        let leaked = "./textures/east.xpm".len() + 1;
        assert_contains_all(
            &stderr,
            &[
                "Memory leaks detected:",
                "Total leaks: 1",
                &format!("Total memory leaked: {leaked} bytes"),
                "Id",
                "Address",
                "Size",
                &format!("{leaked} B"),
            ],
        );
        assert!(!stderr.contains("Invalid or double free"));
    }

    // cargo run -p test-leaks --example json
    #[test]
    fn test_json_output() {
        let output = run_example("json", None);
        let stderr = String::from_utf8_lossy(&output.stderr);

        let records: Vec<serde_json::Value> = stderr
            .lines()
            .filter(|line| line.starts_with('{'))
            .map(|line| serde_json::from_str(line).expect("invalid JSON line"))
            .collect();

        let ops: Vec<&str> = records
            .iter()
            .map(|record| record["op"].as_str().unwrap())
            .collect();
        assert_eq!(
            ops,
            ["acquire", "acquire", "release", "invalid-release", "leak-report"]
        );

        assert_eq!(records[1]["id"], 2);
        assert_eq!(records[1]["total"], 64);
        assert_eq!(records[2]["size"], 40);
        assert_eq!(records[3]["active"], 1);
        assert!(records[0]["address"].as_str().unwrap().starts_with("0x"));

        let report = &records[4];
        assert_eq!(report["leak_count"], 1);
        assert_eq!(report["total_bytes"], 24);
        assert_eq!(report["leaks"][0]["id"], 1);
        assert_eq!(report["leaks"][0]["size"], 24);
    }

    // cargo run -p test-leaks --example global_alloc --features global-alloc
    #[test]
    fn test_global_alloc_output() {
        let output = run_example("global_alloc", Some("global-alloc"));
        let stderr = String::from_utf8_lossy(&output.stderr);

        assert_contains_all(&stderr, &["Memory leaks detected:", "- 1000 bytes"]);
        assert!(!stderr.contains("├ alloc"), "quiet session printed operations");
    }

    // MEMTRAIL_QUIET=0 cargo run -p test-leaks --example global_alloc --features global-alloc
    #[test]
    fn test_global_alloc_names_allocating_function() {
        if !addr2line_available() {
            return;
        }

        let output = run_example_with_env(
            "global_alloc",
            Some("global-alloc"),
            &[("MEMTRAIL_QUIET", "0")],
        );
        let stderr = String::from_utf8_lossy(&output.stderr);

        assert_contains_all(&stderr, &["├ alloc", "build_lookup", "scratch_work"]);
        assert!(!stderr.contains("with_tracker"), "Got:\n{stderr}");
        assert!(!stderr.contains("GlobalAlloc"), "Got:\n{stderr}");
    }

    // cargo run -p test-leaks --example scenario, with overrides from the environment
    #[test]
    fn test_env_format_override() {
        let output = Command::new("cargo")
            .args(["run", "-p", "test-leaks", "--example", "scenario"])
            .env("MEMTRAIL_FORMAT", "json")
            .env("MEMTRAIL_QUIET", "1")
            .output()
            .expect("Failed to execute command");

        assert!(output.status.success());
        let stderr = String::from_utf8_lossy(&output.stderr);
        let json_lines: Vec<&str> = stderr.lines().filter(|l| l.starts_with('{')).collect();

        assert_eq!(json_lines.len(), 2, "Got:\n{stderr}");
        assert!(json_lines[0].contains(r#""op":"invalid-release""#));
        assert!(json_lines[1].contains(r#""op":"leak-report""#));
    }
}
