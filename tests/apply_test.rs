#[cfg(test)]
mod tests {
    use slotswap::apply::confirm::{confirm_boot, ConfirmOutcome};
    use slotswap::apply::host::Host;
    use slotswap::apply::{Applier, ApplyOptions};
    use slotswap::bootconf::{rewrite_root_partlabel, stage};
    use slotswap::error::ApplyError;
    use slotswap::slot::{Slot, SlotBinding, SlotLayout};
    use slotswap::version_file::VersionFile;
    use std::fs::{self, File};
    use std::io;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    const MIB: usize = 1024 * 1024;
    const DEVICE_SIZE: u64 = 16 * MIB as u64;
    const EXTLINUX: &str = "\
DEFAULT qemu
LABEL qemu
  KERNEL /boot/Image
  APPEND console=ttyAMA0 root=PARTLABEL=rootfsA rootwait rw
";

    struct Device {
        root: bool,
        cmdline: String,
    }

    impl Host for Device {
        fn is_privileged(&self) -> bool {
            self.root
        }

        fn boot_cmdline(&self) -> io::Result<String> {
            Ok(self.cmdline.clone())
        }

        fn sync_filesystems(&self) {}
    }

    fn booted_from(label: &str) -> Device {
        Device {
            root: true,
            cmdline: format!("console=ttyAMA0 root=PARTLABEL={} rootwait rw", label),
        }
    }

    struct Board {
        tmp: TempDir,
        layout: SlotLayout,
        bootconf: PathBuf,
    }

    impl Board {
        /// Two sparse 16 MiB "partitions" and a boot config naming slot A.
        fn new() -> Self {
            let tmp = TempDir::new().unwrap();
            let layout = SlotLayout {
                a: SlotBinding::new(tmp.path().join("vda2"), "rootfsA"),
                b: SlotBinding::new(tmp.path().join("vda3"), "rootfsB"),
            };
            for binding in [&layout.a, &layout.b] {
                File::create(&binding.device)
                    .unwrap()
                    .set_len(DEVICE_SIZE)
                    .unwrap();
            }
            let bootconf = tmp.path().join("extlinux.conf");
            fs::write(&bootconf, EXTLINUX).unwrap();
            Self {
                tmp,
                layout,
                bootconf,
            }
        }

        fn image(&self, len: usize) -> PathBuf {
            let path = self.tmp.path().join("rootfs.ext4");
            let data: Vec<u8> = (0..len).map(|i| (i % 241) as u8 | 1).collect();
            fs::write(&path, data).unwrap();
            path
        }

        fn options(&self, image: PathBuf) -> ApplyOptions {
            ApplyOptions {
                image,
                bootconf: self.bootconf.clone(),
                dry_run: false,
                layout: self.layout.clone(),
                state_dir: self.tmp.path().join("state"),
                pending_version: None,
            }
        }

        fn state_dir(&self) -> PathBuf {
            self.tmp.path().join("state")
        }

        fn untouched(path: &Path) -> bool {
            fs::read(path).unwrap().iter().all(|&b| b == 0)
        }
    }

    #[test]
    fn test_apply_10mib_into_16mib_slot() -> anyhow::Result<()> {
        let board = Board::new();
        let image = board.image(10 * MIB);

        let report = Applier::new(board.options(image.clone()), booted_from("rootfsA")).run()?;

        assert_eq!(report.plan.active, Slot::A);
        assert_eq!(report.plan.target, Slot::B);
        assert_eq!(report.bytes_written, 10 * MIB as u64);

        let target = fs::read(&board.layout.b.device)?;
        assert_eq!(target.len() as u64, DEVICE_SIZE);
        assert_eq!(&target[..10 * MIB], &fs::read(&image)?[..]);
        assert!(Board::untouched(&board.layout.a.device));

        let conf = fs::read_to_string(&board.bootconf)?;
        assert!(conf.contains("root=PARTLABEL=rootfsB"));
        assert!(!conf.contains("root=PARTLABEL=rootfsA"));
        Ok(())
    }

    #[test]
    fn test_apply_20mib_into_16mib_slot_is_refused() {
        let board = Board::new();
        let image = board.image(20 * MIB);

        let err = Applier::new(board.options(image), booted_from("rootfsA"))
            .run()
            .unwrap_err();

        assert!(matches!(err, ApplyError::ImageTooLarge { .. }));
        assert_eq!(err.exit_code(), 30);
        assert!(Board::untouched(&board.layout.b.device));
        assert_eq!(fs::read_to_string(&board.bootconf).unwrap(), EXTLINUX);
    }

    #[test]
    fn test_apply_from_slot_b_targets_a() -> anyhow::Result<()> {
        let board = Board::new();
        fs::write(
            &board.bootconf,
            EXTLINUX.replace("rootfsA", "rootfsB"),
        )?;
        let image = board.image(MIB);

        let report = Applier::new(board.options(image), booted_from("rootfsB")).run()?;

        assert_eq!(report.plan.target, Slot::A);
        assert!(fs::read_to_string(&board.bootconf)?.contains("root=PARTLABEL=rootfsA"));
        assert!(Board::untouched(&board.layout.b.device));
        Ok(())
    }

    #[test]
    fn test_dry_run_reports_plan_only() -> anyhow::Result<()> {
        let board = Board::new();
        let image = board.image(MIB);
        let mut options = board.options(image);
        options.dry_run = true;

        let report = Applier::new(options, booted_from("rootfsA")).run()?;

        assert!(report.dry_run);
        assert_eq!(report.plan.target_label, "rootfsB");
        assert!(Board::untouched(&board.layout.b.device));
        assert_eq!(fs::read_to_string(&board.bootconf)?, EXTLINUX);
        Ok(())
    }

    #[test]
    fn test_interrupted_commit_keeps_old_config() -> anyhow::Result<()> {
        let board = Board::new();
        let rewritten =
            rewrite_root_partlabel(&board.bootconf, EXTLINUX, &board.layout, "rootfsB")?;

        // Staged but never committed
        drop(stage(&board.bootconf, &rewritten)?);
        assert_eq!(fs::read_to_string(&board.bootconf)?, EXTLINUX);
        let leftovers = fs::read_dir(board.tmp.path())?
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);

        stage(&board.bootconf, &rewritten)?.commit()?;
        assert_eq!(fs::read_to_string(&board.bootconf)?, rewritten);
        Ok(())
    }

    #[test]
    fn test_pending_version_confirmed_after_reboot() -> anyhow::Result<()> {
        let board = Board::new();
        let image = board.image(MIB);
        let mut options = board.options(image);
        options.pending_version = Some(6);
        Applier::new(options, booted_from("rootfsA")).run()?;

        let version_file = VersionFile::open_or_create(board.tmp.path().join("update.version"))?;
        version_file.store(5)?;

        // Not rebooted yet
        let outcome = confirm_boot(
            &board.state_dir(),
            &version_file,
            &booted_from("rootfsA").cmdline,
            &board.layout,
        )?;
        assert!(matches!(outcome, ConfirmOutcome::Pending { version: 6, .. }));
        assert_eq!(version_file.read()?, 5);

        // Booted from the new slot
        let outcome = confirm_boot(
            &board.state_dir(),
            &version_file,
            &booted_from("rootfsB").cmdline,
            &board.layout,
        )?;
        assert_eq!(outcome, ConfirmOutcome::Promoted(6));
        assert_eq!(version_file.read()?, 6);

        let outcome = confirm_boot(
            &board.state_dir(),
            &version_file,
            &booted_from("rootfsB").cmdline,
            &board.layout,
        )?;
        assert_eq!(outcome, ConfirmOutcome::NothingPending);
        Ok(())
    }
}
