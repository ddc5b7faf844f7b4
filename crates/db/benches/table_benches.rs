// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! Single-threaded insert and index-scan throughput of one table.

use std::hint::black_box;
use std::time::{Duration, Instant};

use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use petrel_db::{ColumnType, Database, DatabaseConfig, DatabaseDesign, KeyValue, StoreDb, Table};

const RECORDS: usize = 2_000;

fn test_db(dir: &std::path::Path) -> StoreDb {
    let db = StoreDb::new(dir, DatabaseConfig::default()).unwrap();
    let items = db.create_table("Items").unwrap();
    items.create_column("Name", ColumnType::String).unwrap();
    items.create_column("Weight", ColumnType::Int).unwrap();
    items.create_index("Name").unwrap();
    items.create_index("Weight").unwrap();
    db.open_database().unwrap();
    db
}

fn insert_workload(db: &StoreDb) {
    let items = db.table("Items").unwrap();
    for i in 0..RECORDS {
        let mut record = items.new_record().unwrap();
        record.set_string(0, &format!("item-{:06}", (i * 7919) % RECORDS)).unwrap();
        record.set_int(1, (i % 97) as i32).unwrap();
        record.commit().unwrap();
    }
}

fn insert_bench(c: &mut Criterion) {
    let mut group = c.benchmark_group("table");
    group.sample_size(10);
    group.throughput(Throughput::Elements(RECORDS as u64));
    group.bench_function("insert", |b| {
        b.iter_custom(|iters| {
            let mut cumulative = Duration::ZERO;
            for _ in 0..iters {
                // Brand new database every iteration so the heap starts empty.
                let dir = tempfile::tempdir().unwrap();
                let db = test_db(dir.path());
                let start = Instant::now();
                insert_workload(&db);
                cumulative += start.elapsed();
                db.close().unwrap();
            }
            cumulative
        });
    });

    let dir = tempfile::tempdir().unwrap();
    let db = test_db(dir.path());
    insert_workload(&db);
    let items = db.table("Items").unwrap();
    group.bench_function("scan_by_name", |b| {
        b.iter(|| {
            for record in items.create_result_set(0).unwrap() {
                black_box(record.unwrap().id());
            }
        });
    });
    group.bench_function("equality_lookup", |b| {
        let mut i = 0;
        b.iter(|| {
            i = (i + 1) % 97;
            black_box(items.create_result_set_eq(1, KeyValue::Int(i)).unwrap().len());
        });
    });
    group.finish();
}

criterion_group!(benches, insert_bench);
criterion_main!(benches);
