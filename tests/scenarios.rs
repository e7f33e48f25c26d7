//! End-to-end scenarios exercising a fresh container and the
//! `bwxjobadd` reference tool's library-level entry points together,
//! as opposed to the per-module unit tests colocated with each
//! implementation file.

use std::io::Write;

use sos::{
    cli,
    container::Container,
    object::Value,
    schema::{AttrSpec, AttrType},
    store::CommitFlags,
};
use tempfile::tempdir;

#[test]
fn create_schema_insert_lookup_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("container");

    {
        let container = Container::create(&path, 0o750).unwrap();
        let schema = container
            .schema_add(
                "Sample",
                vec![
                    AttrSpec::new("Id", AttrType::Uint32).indexed(),
                    AttrSpec::new("Label", AttrType::Str).array(),
                ],
            )
            .unwrap();

        let obj = container
            .obj_from_value(&schema, &[("Id", Value::Uint32(7)), ("Label", Value::Str("seven".into()))])
            .unwrap();
        assert_eq!(obj.get_by_name("Id").unwrap(), Value::Uint32(7));
        container.commit(CommitFlags::Sync).unwrap();
    }

    let container = Container::open(&path).unwrap();
    let schema = container.schema_by_name("Sample").unwrap();
    let index = container.named_index("Sample.Id", "UINT64", 5, None).unwrap();
    let parts = container.partitions().unwrap();
    let tree = index.active_idx_part(&parts).unwrap();
    let oref = tree.lookup(&7u64.to_le_bytes()).unwrap();

    let part = parts.into_iter().find(|p| p.is_primary()).unwrap();
    let obj = container
        .obj_from_ref(sos::object::ObjectRef { part: part.obj_ref(), oref })
        .unwrap();
    assert_eq!(obj.schema().id, schema.id);
    assert_eq!(obj.to_str_by_name("Label").unwrap(), "seven");
}

#[test]
fn partition_rollover_keeps_root_readable() {
    let dir = tempdir().unwrap();
    let container = Container::create(&dir.path().join("container"), 0o750).unwrap();

    let schema = container
        .schema_add("S", vec![AttrSpec::new("Id", AttrType::Uint32).indexed()])
        .unwrap();
    let root_obj = container.obj_new(&schema).unwrap();
    root_obj.set_by_name("Id", Value::Uint32(1)).unwrap();
    container.obj_index(&root_obj).unwrap();

    let p2 = container.part_new("2026").unwrap();
    let p2 = container.part_primary_set(&p2).unwrap();
    assert!(p2.is_primary());

    let parts = container.partitions().unwrap();
    let root = parts.iter().find(|p| p.name() == "__ROOT__").unwrap();
    assert!(!root.is_primary());
    assert!(root.is_active());

    // The object allocated before rollover must still resolve.
    let back = container.obj_from_ref(root_obj.obj_ref()).unwrap();
    assert_eq!(back.get_by_name("Id").unwrap(), Value::Uint32(1));
}

#[test]
fn duplicate_partition_name_is_rejected() {
    let dir = tempdir().unwrap();
    let container = Container::create(&dir.path().join("container"), 0o750).unwrap();
    container.part_new("dup").unwrap();
    let err = container.part_new("dup").unwrap_err();
    assert!(matches!(err, sos::Error::AlreadyExists(_)));
    assert_eq!(container.partitions().unwrap().len(), 2);
}

#[test]
fn job_ingest_builds_comptime_and_jobcomp_indices() {
    let dir = tempdir().unwrap();
    let container_path = dir.path().join("container");
    let comp_file_path = dir.path().join("comps.txt");
    {
        let mut f = std::fs::File::create(&comp_file_path).unwrap();
        writeln!(f, "100").unwrap();
        writeln!(f, "200").unwrap();
        writeln!(f, "300").unwrap();
    }

    let args = cli::Args {
        container: container_path.clone(),
        jobid: 5,
        start: "2023/11/14 22:13:20".to_string(),
        end: "2023/11/14 23:00:00".to_string(),
        comp_file: comp_file_path,
        name: "job-five".to_string(),
        uname: "alice".to_string(),
    };

    cli::run(&args).unwrap();

    {
        let container = Container::open(&container_path).unwrap();
        let parts = container.partitions().unwrap();

        let comp_time = container.named_index("CompTime", "UINT64", 5, None).unwrap();
        let comp_time_tree = comp_time.active_idx_part(&parts).unwrap();
        for comp_id in [100u32, 200, 300] {
            let key = cli::pack_compound_key(comp_id, 1_700_000_000);
            assert!(comp_time_tree.lookup(&key).is_some(), "missing CompTime entry for {}", comp_id);
        }

        let job_comp = container.named_index("JobComp", "UINT64", 5, None).unwrap();
        let job_comp_tree = job_comp.active_idx_part(&parts).unwrap();
        for comp_id in [100u32, 200, 300] {
            let key = cli::pack_compound_key(5, comp_id);
            assert!(job_comp_tree.lookup(&key).is_some(), "missing JobComp entry for {}", comp_id);
        }
    }

    // Re-running with the same job id must not create a second job
    // object (idempotent insert, see DESIGN.md) and must not collide
    // with the still-open indices/objects files from the first run.
    cli::run(&args).unwrap();

    let container = Container::open(&container_path).unwrap();
    let job_index = container.named_index("Job.JobId", "UINT64", 5, None).unwrap();
    assert!(job_index.lookup_any(&5u64.to_le_bytes()).is_some());
}

#[test]
fn part_delete_tears_down_its_index_sub_trees() {
    let dir = tempdir().unwrap();
    let container = Container::create(&dir.path().join("container"), 0o750).unwrap();
    container
        .schema_add("S", vec![AttrSpec::new("Id", AttrType::Uint32).indexed()])
        .unwrap();
    let p2 = container.part_new("P2").unwrap();

    let index_path = dir.path().join("container").join("P2").join("S.Id.idx");
    assert!(index_path.exists());

    container.part_delete(&p2).unwrap();
    assert!(!index_path.exists());
    assert_eq!(container.partitions().unwrap().len(), 1);

    let root = container.partitions().unwrap().into_iter().find(|p| p.is_primary()).unwrap();
    assert!(container.part_delete(&root).is_err(), "deleting the primary partition must be rejected");
}

#[test]
fn string_indexed_attribute_orders_lexically() {
    let dir = tempdir().unwrap();
    let container = Container::create(&dir.path().join("container"), 0o750).unwrap();
    let schema = container
        .schema_add("Word", vec![AttrSpec::new("Text", AttrType::Str).indexed().array()])
        .unwrap();

    for word in ["banana", "apple", "cherry"] {
        container
            .obj_from_value(&schema, &[("Text", Value::Str(word.to_string()))])
            .unwrap();
    }

    let parts = container.partitions().unwrap();
    let index = container.named_index("Word.Text", "STRING", 5, None).unwrap();
    let tree = index.active_idx_part(&parts).unwrap();
    let ordered: Vec<String> = tree
        .iter()
        .into_iter()
        .map(|(k, _)| String::from_utf8_lossy(&k[..k.len() - 1]).into_owned())
        .collect();
    assert_eq!(ordered, vec!["apple", "banana", "cherry"]);
}
