#[cfg(test)]
mod tests {
    use std::process::Command;

    fn ota_apply() -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_ota-apply"));
        cmd.env_remove("SLOTSWAP_CONFIG").env_remove("RUST_LOG");
        cmd
    }

    #[test]
    fn test_help() {
        let out = ota_apply().arg("--help").output().unwrap();
        assert!(out.status.success());
        let text = String::from_utf8_lossy(&out.stdout);
        assert!(text.contains("--image"));
        assert!(text.contains("--dry-run"));
        assert!(text.contains("--bootconf"));
    }

    #[test]
    fn test_missing_image_is_usage_error() {
        let out = ota_apply().output().unwrap();
        assert_eq!(out.status.code(), Some(2));
    }

    #[test]
    fn test_unprivileged_exit_code() {
        if unsafe { libc::geteuid() } == 0 {
            eprintln!("Skipping test: running as root");
            return;
        }

        let tmp = tempfile::TempDir::new().unwrap();
        let out = ota_apply()
            .args(["--image", "/nonexistent/rootfs.ext4", "--state-dir"])
            .arg(tmp.path())
            .output()
            .unwrap();

        assert_eq!(out.status.code(), Some(10));
        assert!(String::from_utf8_lossy(&out.stderr).contains("FATAL"));
    }

    #[test]
    fn test_unprivileged_wins_over_bad_config() {
        if unsafe { libc::geteuid() } == 0 {
            eprintln!("Skipping test: running as root");
            return;
        }

        let tmp = tempfile::TempDir::new().unwrap();
        let config = tmp.path().join("slotswap.toml");
        std::fs::write(&config, "[slots\nlayout = ").unwrap();

        let out = ota_apply()
            .env("SLOTSWAP_CONFIG", &config)
            .args(["--image", "/nonexistent/rootfs.ext4"])
            .output()
            .unwrap();

        assert_eq!(out.status.code(), Some(10));
    }

    #[test]
    fn test_confirm_boot_with_nothing_pending() {
        let tmp = tempfile::TempDir::new().unwrap();
        let cmdline = tmp.path().join("cmdline");
        std::fs::write(&cmdline, "root=PARTLABEL=rootfsA rw\n").unwrap();

        let out = ota_apply()
            .arg("--confirm-boot")
            .arg("--state-dir")
            .arg(tmp.path().join("state"))
            .arg("--version-file")
            .arg(tmp.path().join("update.version"))
            .arg("--cmdline")
            .arg(&cmdline)
            .output()
            .unwrap();

        assert!(out.status.success());
        assert!(String::from_utf8_lossy(&out.stdout).contains("Nothing pending"));
        assert_eq!(
            std::fs::read_to_string(tmp.path().join("update.version")).unwrap(),
            "0\n"
        );
    }
}
