use std::io::Read;

/// One entry read back from an archive.
#[derive(Debug)]
pub struct ArchivedEntry {
    pub path: std::path::PathBuf,
    pub kind: tar::EntryType,
    pub content: Vec<u8>,
    pub link: Option<std::path::PathBuf>,
}

pub fn read_archive(archive: &[u8]) -> std::io::Result<Vec<ArchivedEntry>> {
    let mut archive = tar::Archive::new(archive);
    let mut entries = vec![];
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        let kind = entry.header().entry_type();
        let link = entry.link_name()?.map(|link| link.into_owned());
        let mut content = vec![];
        entry.read_to_end(&mut content)?;
        entries.push(ArchivedEntry {
            path,
            kind,
            content,
            link,
        });
    }
    Ok(entries)
}

pub fn setup_test_dir(tmp_dir: &std::path::Path) -> std::io::Result<()> {
    // foo
    // |- 0.txt
    // |- bar
    //    |- 1.txt
    //    |- 2.txt
    //    |- 3.txt
    // |- baz
    //    |- 4.txt
    //    |- 5.txt -> ../bar/2.txt
    //    |- 6.txt -> (absolute path) .../foo/bar/3.txt
    // |- empty
    let foo_path = tmp_dir.join("foo");
    std::fs::create_dir(&foo_path)?;
    std::fs::write(foo_path.join("0.txt"), "0")?;
    let bar_path = foo_path.join("bar");
    std::fs::create_dir(&bar_path)?;
    std::fs::write(bar_path.join("1.txt"), "1")?;
    std::fs::write(bar_path.join("2.txt"), "2")?;
    std::fs::write(bar_path.join("3.txt"), "3")?;
    let baz_path = foo_path.join("baz");
    std::fs::create_dir(&baz_path)?;
    std::fs::write(baz_path.join("4.txt"), "4")?;
    std::os::unix::fs::symlink("../bar/2.txt", baz_path.join("5.txt"))?;
    std::os::unix::fs::symlink(bar_path.join("3.txt"), baz_path.join("6.txt"))?;
    std::fs::create_dir(foo_path.join("empty"))?;
    Ok(())
}
