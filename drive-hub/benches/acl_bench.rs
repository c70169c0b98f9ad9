use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use drive_hub_core::acl::{Acl, Grant};
use drive_hub_core::cache::FileTree;
use drive_hub_core::ledger::{FileId, FileRecord};

fn record(id: u64, parent: u64, is_folder: bool) -> FileRecord {
    FileRecord {
        id: FileId(id),
        is_folder,
        parent_folder: FileId(parent),
        storage_ref: if is_folder {
            String::new()
        } else {
            format!("ref-{id}")
        },
        file_size: 64,
        last_modification: Utc::now(),
        name: format!("node-{id}"),
        labels: Vec::new(),
        owner: "owner".to_string(),
        is_public: false,
        is_deleted: false,
        permission_addresses: Vec::new(),
        permission_groups: Vec::new(),
    }
}

fn bench_entity_read_decision(c: &mut Criterion) {
    let mut group = c.benchmark_group("acl_entity_read");

    for grants in [10usize, 100, 1000].iter() {
        let file = FileId(1);
        let mut acl = Acl::new();
        for i in 0..*grants {
            acl.set_entity_permission(file, &format!("entity-{i}"), Grant::READ);
        }
        let holder = format!("entity-{}", grants - 1);

        group.bench_with_input(BenchmarkId::new("grant_hit", grants), grants, |b, _| {
            b.iter(|| acl.can_read(black_box(file), "owner", false, black_box(&holder)));
        });
        group.bench_with_input(BenchmarkId::new("grant_miss", grants), grants, |b, _| {
            b.iter(|| acl.can_read(black_box(file), "owner", false, black_box("stranger")));
        });
    }

    group.finish();
}

fn bench_group_read_decision(c: &mut Criterion) {
    let mut group = c.benchmark_group("acl_group_read");

    for members in [10usize, 100, 1000].iter() {
        let file = FileId(1);
        let mut acl = Acl::new();
        let team = acl.create_group("team");
        for i in 0..*members {
            acl.add_entity_to_group(team, &format!("member-{i}")).unwrap();
        }
        acl.set_group_permission(file, team, Grant::READ).unwrap();
        let last = format!("member-{}", members - 1);

        group.bench_with_input(BenchmarkId::new("members", members), members, |b, _| {
            b.iter(|| acl.can_read(black_box(file), "owner", false, black_box(&last)));
        });
    }

    group.finish();
}

fn bench_tree_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("tree_build");

    for size in [100u64, 1000, 10000].iter() {
        // Root, a layer of folders, then files spread across them.
        let folders = (size / 10).max(1);
        let mut records = vec![record(0, 0, true)];
        for f in 0..folders {
            records.push(record(1 + f, 0, true));
        }
        for i in 0..*size {
            records.push(record(1 + folders + i, 1 + (i % folders), false));
        }

        group.bench_with_input(BenchmarkId::new("files", size), size, |b, _| {
            b.iter(|| FileTree::build(black_box(records.clone())));
        });
    }

    group.finish();
}

fn bench_path_resolution(c: &mut Criterion) {
    let mut group = c.benchmark_group("tree_path");

    for depth in [10u64, 100, 1000].iter() {
        let mut records = vec![record(0, 0, true)];
        for level in 1..=*depth {
            records.push(record(level, level - 1, true));
        }
        let tree = FileTree::build(records);

        group.bench_with_input(BenchmarkId::new("depth", depth), depth, |b, _| {
            b.iter(|| tree.path(black_box(FileId(*depth))).unwrap());
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_entity_read_decision,
    bench_group_read_decision,
    bench_tree_build,
    bench_path_resolution
);
criterion_main!(benches);
