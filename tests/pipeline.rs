mod common;

use std::fs::File;
use std::io::Read;

use assert_matches::assert_matches;
use flate2::read::GzDecoder;

use adc_download_cache::domain::Artifact;
use adc_download_cache::error::CacheError;
use adc_download_cache::pipeline::{
    CacheOutcome, FinishOutcome, FinishStudyOutcome, SubmitOutcome, TriggerOutcome,
};
use adc_download_cache::queue::{FinishRequest, FinishSource, Message, QueueName};
use adc_download_cache::records::EntryFilter;

use common::{Harness, local_repertoire, rearrangements, repertoire, settings, sync_repository};

fn seed_s1(harness: &Harness) {
    harness.client.add_study(
        "S1",
        &[repertoire("S1", "REP1"), repertoire("S1", "REP2")],
    );
}

fn repertoire_uuid(harness: &Harness, repertoire_id: &str) -> String {
    harness
        .pipeline
        .records()
        .repertoire_entries(&EntryFilter::all().repertoire(repertoire_id))
        .unwrap()
        .remove(0)
        .uuid
}

fn tar_entries(path: &std::path::Path) -> Vec<String> {
    let mut archive = tar::Archive::new(File::open(path).unwrap());
    let mut names = archive
        .entries()
        .unwrap()
        .map(|entry| entry.unwrap().path().unwrap().display().to_string())
        .collect::<Vec<_>>();
    names.sort();
    names
}

#[test]
fn sync_repository_scenario_caches_study() {
    let harness = Harness::sync();
    seed_s1(&harness);
    let pipeline = &harness.pipeline;

    let first = pipeline.process_submit().unwrap();
    let study = pipeline.records().study_entry("R1", "S1").unwrap().unwrap();
    let repertoires = pipeline
        .records()
        .repertoire_entries(&EntryFilter::study("R1", "S1"))
        .unwrap();
    assert_eq!(repertoires.len(), 2);
    let rep1 = repertoire_uuid(&harness, "REP1");
    assert_eq!(
        first,
        SubmitOutcome::Cache {
            repertoire_cache_uuid: rep1.clone()
        }
    );

    let outcome = pipeline.process_cache(&rep1).unwrap();
    assert_matches!(outcome, CacheOutcome::Finished(FinishOutcome::Cached { .. }));
    assert_eq!(outcome.follow_up(), Some(Message::Trigger));
    let cached = pipeline.records().repertoire_entry(&rep1).unwrap().unwrap();
    assert!(cached.value.is_cached);
    let artifact = cached.value.artifact.unwrap();
    assert_eq!(artifact.archive_file, "REP1.airr.tsv.gz");
    assert!(artifact.file_size.unwrap() > 0);

    let rep2 = repertoire_uuid(&harness, "REP2");
    assert_eq!(
        pipeline.process_submit().unwrap(),
        SubmitOutcome::Cache {
            repertoire_cache_uuid: rep2.clone()
        }
    );
    pipeline.process_cache(&rep2).unwrap();

    assert_eq!(
        pipeline.process_submit().unwrap(),
        SubmitOutcome::FinishStudy {
            study_cache_uuid: study.uuid.clone()
        }
    );
    let finished = pipeline.process_finish_study(&study.uuid).unwrap();
    assert_eq!(
        finished,
        FinishStudyOutcome::Cached {
            archives: vec!["study.tar".to_string()]
        }
    );

    let study = pipeline.records().study_entry("R1", "S1").unwrap().unwrap();
    assert!(study.value.is_cached);
    assert_matches!(study.value.artifact, Some(Artifact::Single(ref file)) if file.archive_file == "study.tar");

    let dir = harness.study_dir(&study.uuid);
    assert_eq!(
        tar_entries(dir.join("study.tar").as_std_path()),
        vec!["REP1.airr.tsv.gz", "REP2.airr.tsv.gz", "repertoires.airr.json"]
    );
    assert_eq!(pipeline.process_submit().unwrap(), SubmitOutcome::Idle);
}

#[test]
fn finish_study_backfills_missing_repertoire_sizes() {
    let harness = Harness::sync();
    seed_s1(&harness);
    let pipeline = &harness.pipeline;
    for repertoire_id in ["REP1", "REP2"] {
        pipeline.process_submit().unwrap();
        pipeline
            .process_cache(&repertoire_uuid(&harness, repertoire_id))
            .unwrap();
    }

    let rep1 = repertoire_uuid(&harness, "REP1");
    let mut entry = pipeline.records().repertoire_entry(&rep1).unwrap().unwrap();
    entry.value.artifact.as_mut().unwrap().file_size = None;
    pipeline.records().update_repertoire_entry(&entry).unwrap();

    let study = pipeline.records().study_entry("R1", "S1").unwrap().unwrap();
    assert_eq!(
        pipeline.process_finish_study(&study.uuid).unwrap(),
        FinishStudyOutcome::Cached {
            archives: vec!["study.tar".to_string()]
        }
    );

    let dir = harness.study_dir(&study.uuid);
    let on_disk = std::fs::metadata(dir.join("REP1.airr.tsv.gz").as_std_path())
        .unwrap()
        .len();
    let entry = pipeline.records().repertoire_entry(&rep1).unwrap().unwrap();
    assert_eq!(entry.value.artifact.unwrap().file_size, Some(on_disk));
    assert_eq!(
        tar_entries(dir.join("study.tar").as_std_path()),
        vec!["REP1.airr.tsv.gz", "REP2.airr.tsv.gz", "repertoires.airr.json"]
    );
}

#[test]
fn run_until_idle_drives_full_cycle() {
    let harness = Harness::sync();
    seed_s1(&harness);
    let pipeline = &harness.pipeline;

    pipeline.enable_and_trigger(true).unwrap();
    pipeline.run_until_idle(100);

    let study = pipeline.records().study_entry("R1", "S1").unwrap().unwrap();
    assert!(study.value.is_cached);
    let mut downloads = harness.client.downloads.lock().unwrap().clone();
    downloads.sort();
    assert_eq!(downloads, vec!["REP1", "REP2"]);
    // two repertoire files plus the study archive
    assert_eq!(harness.links.created_count(), 3);
    assert!(
        harness.links.created.lock().unwrap()[0]
            .starts_with(&format!("https://files.example.org/cache/{}/", study.uuid))
    );
    assert_eq!(harness.alerts.count(), 0);
    for queue in QueueName::ALL {
        assert_eq!(pipeline.queues().counts(queue).failed, 0, "{queue}");
    }
}

#[test]
fn cached_repertoire_file_is_gzipped_rearrangements() {
    let harness = Harness::sync();
    seed_s1(&harness);
    harness.pipeline.process_submit().unwrap();
    let rep1 = repertoire_uuid(&harness, "REP1");
    harness.pipeline.process_cache(&rep1).unwrap();

    let study = harness
        .pipeline
        .records()
        .study_entry("R1", "S1")
        .unwrap()
        .unwrap();
    let path = harness.study_dir(&study.uuid).join("REP1.airr.tsv.gz");
    let mut content = String::new();
    GzDecoder::new(File::open(path.as_std_path()).unwrap())
        .read_to_string(&mut content)
        .unwrap();
    assert_eq!(content, rearrangements("REP1"));

    let leftovers = std::fs::read_dir(harness.pipeline.layout().temp_dir().as_std_path())
        .unwrap()
        .count();
    assert_eq!(leftovers, 0);
}

#[test]
fn trigger_is_single_flight() {
    let harness = Harness::sync();
    let pipeline = &harness.pipeline;
    pipeline.settings().set_enabled(true).unwrap();

    pipeline.enqueue(Message::Cache {
        repertoire_cache_uuid: "in-flight".to_string(),
    });
    let active = pipeline.queues().claim(QueueName::Cache).unwrap();

    assert_eq!(pipeline.process_trigger().unwrap(), TriggerOutcome::Busy);
    assert_eq!(pipeline.process_trigger().unwrap(), TriggerOutcome::Busy);
    assert_eq!(pipeline.queues().waiting_count(QueueName::Submit), 0);

    pipeline.queues().complete(&active, true);
    assert_eq!(pipeline.process_trigger().unwrap(), TriggerOutcome::Dispatched);
    // the waiting Submit blocks a second dispatch
    assert_eq!(pipeline.process_trigger().unwrap(), TriggerOutcome::Busy);
    assert_eq!(pipeline.queues().waiting_count(QueueName::Submit), 1);
}

#[test]
fn disabled_cache_never_dispatches() {
    let harness = Harness::sync();
    seed_s1(&harness);

    assert_eq!(
        harness.pipeline.process_trigger().unwrap(),
        TriggerOutcome::Disabled
    );
    harness.pipeline.set_cache_enabled(false).unwrap();
    harness.pipeline.run_until_idle(10);

    assert_eq!(harness.pipeline.queues().counts(QueueName::Submit).completed, 0);
    assert!(
        harness
            .pipeline
            .records()
            .study_entries(&EntryFilter::all())
            .unwrap()
            .is_empty()
    );
}

#[test]
fn submit_dispatches_exactly_one_unit() {
    let harness = Harness::sync();
    seed_s1(&harness);
    harness
        .client
        .add_study("S2", &[repertoire("S2", "REP3"), repertoire("S2", "REP4")]);

    harness.pipeline.enqueue(Message::Submit);
    assert_eq!(harness.pipeline.run_queue_once(QueueName::Submit), Some(true));

    assert_eq!(harness.pipeline.queues().waiting_count(QueueName::Cache), 1);
    assert_eq!(harness.pipeline.queues().waiting_count(QueueName::FinishStudy), 0);
    assert_eq!(
        harness
            .pipeline
            .records()
            .repertoire_entries(&EntryFilter::all())
            .unwrap()
            .len(),
        4
    );
}

#[test]
fn finish_study_waits_for_every_repertoire() {
    let harness = Harness::sync();
    seed_s1(&harness);
    let pipeline = &harness.pipeline;
    pipeline.process_submit().unwrap();
    pipeline
        .process_cache(&repertoire_uuid(&harness, "REP1"))
        .unwrap();

    let study = pipeline.records().study_entry("R1", "S1").unwrap().unwrap();
    for _ in 0..3 {
        assert_matches!(pipeline.process_submit().unwrap(), SubmitOutcome::Cache { .. });
    }
    assert_matches!(
        pipeline.process_finish_study(&study.uuid),
        Err(CacheError::EntryNotReady(_))
    );
    assert!(
        !pipeline
            .records()
            .study_entry("R1", "S1")
            .unwrap()
            .unwrap()
            .value
            .is_cached
    );
}

#[test]
fn finish_is_idempotent() {
    let harness = Harness::sync();
    seed_s1(&harness);
    let pipeline = &harness.pipeline;
    pipeline.enable_and_trigger(true).unwrap();
    pipeline.run_until_idle(100);
    let links_before = harness.links.created_count();

    let source = harness.temp.path().join("duplicate.tsv");
    std::fs::write(&source, rearrangements("REP1")).unwrap();
    let request = FinishRequest {
        repertoire_cache_uuid: repertoire_uuid(&harness, "REP1"),
        source: FinishSource::LocalFile {
            final_file: camino::Utf8PathBuf::from_path_buf(source.clone()).unwrap(),
            delete_file: true,
        },
    };
    assert_eq!(pipeline.process_finish(&request).unwrap(), FinishOutcome::Skipped);
    assert_eq!(pipeline.process_finish(&request).unwrap(), FinishOutcome::Skipped);
    assert!(source.exists());

    let study = pipeline.records().study_entry("R1", "S1").unwrap().unwrap();
    assert_eq!(
        pipeline.process_finish_study(&study.uuid).unwrap(),
        FinishStudyOutcome::Skipped
    );
    assert_eq!(harness.links.created_count(), links_before);
}

#[test]
fn clear_is_destructive_and_terminal() {
    let harness = Harness::sync();
    seed_s1(&harness);
    let pipeline = &harness.pipeline;
    pipeline.enable_and_trigger(true).unwrap();
    pipeline.run_until_idle(100);
    let study = pipeline.records().study_entry("R1", "S1").unwrap().unwrap();

    let report = pipeline.process_clear("R1", "S1").unwrap();
    assert_eq!(report.repertoires_removed, 2);
    assert_eq!(report.link_failures, 0);
    assert_eq!(harness.links.deleted.lock().unwrap().len(), 3);
    assert!(!harness.study_dir(&study.uuid).as_std_path().exists());
    assert!(pipeline.records().study_entry("R1", "S1").unwrap().is_none());
    assert!(
        pipeline
            .records()
            .repertoire_entries(&EntryFilter::study("R1", "S1"))
            .unwrap()
            .is_empty()
    );

    assert_matches!(pipeline.process_submit().unwrap(), SubmitOutcome::Cache { .. });
    let rediscovered = pipeline.records().study_entry("R1", "S1").unwrap().unwrap();
    assert_ne!(rediscovered.uuid, study.uuid);
    assert!(!rediscovered.value.is_cached);
}

#[test]
fn clear_continues_past_link_failures() {
    let harness = Harness::sync();
    seed_s1(&harness);
    harness.pipeline.enable_and_trigger(true).unwrap();
    harness.pipeline.run_until_idle(100);
    *harness.links.fail_delete.lock().unwrap() = true;

    let report = harness.pipeline.process_clear("R1", "S1").unwrap();
    assert_eq!(report.link_failures, 3);
    assert_eq!(harness.alerts.count(), 3);
    assert!(
        harness
            .pipeline
            .records()
            .study_entries(&EntryFilter::all())
            .unwrap()
            .is_empty()
    );
}

#[test]
fn clear_without_entry_fails_and_alerts() {
    let harness = Harness::sync();
    assert_matches!(
        harness.pipeline.process_clear("R1", "missing"),
        Err(CacheError::EntryNotFound(_))
    );

    harness.pipeline.enqueue(Message::Clear {
        repository_id: "R1".to_string(),
        study_id: "missing".to_string(),
    });
    assert_eq!(harness.pipeline.run_queue_once(QueueName::Clear), Some(false));
    assert_eq!(harness.pipeline.queues().counts(QueueName::Clear).failed, 1);
    assert_eq!(harness.alerts.count(), 1);
}

#[test]
fn local_study_waits_for_project_load() {
    let harness = Harness::sync();
    harness
        .client
        .add_study("S9", &[local_repertoire("S9", "REP9", "project-1")]);

    assert_eq!(harness.pipeline.process_submit().unwrap(), SubmitOutcome::Idle);
    assert!(
        harness
            .pipeline
            .records()
            .study_entry("R1", "S9")
            .unwrap()
            .is_none()
    );

    harness
        .load_status
        .loaded
        .lock()
        .unwrap()
        .insert("project-1".to_string(), true);
    assert_matches!(
        harness.pipeline.process_submit().unwrap(),
        SubmitOutcome::Cache { .. }
    );
}

#[test]
fn listing_failure_aborts_submit_without_state_change() {
    let harness = Harness::sync();
    seed_s1(&harness);
    *harness.client.fail_listing.lock().unwrap() = true;
    harness.pipeline.settings().set_enabled(true).unwrap();

    harness.pipeline.enqueue(Message::Submit);
    assert_eq!(harness.pipeline.run_queue_once(QueueName::Submit), Some(false));
    assert_eq!(harness.alerts.count(), 1);
    assert!(
        harness
            .pipeline
            .records()
            .study_entries(&EntryFilter::all())
            .unwrap()
            .is_empty()
    );

    // the next cycle retries as is
    *harness.client.fail_listing.lock().unwrap() = false;
    assert_matches!(
        harness.pipeline.process_submit().unwrap(),
        SubmitOutcome::Cache { .. }
    );
}

#[test]
fn recache_rebuilds_only_the_study_archive() {
    let harness = Harness::sync();
    seed_s1(&harness);
    let pipeline = &harness.pipeline;
    pipeline.enable_and_trigger(true).unwrap();
    pipeline.run_until_idle(100);

    pipeline.recache_study_metadata("R1", "S1").unwrap();
    let study = pipeline.records().study_entry("R1", "S1").unwrap().unwrap();
    assert!(!study.value.is_cached);
    assert!(study.value.artifact.is_none());
    assert_eq!(harness.links.deleted.lock().unwrap().as_slice(), ["postit-3"]);
    assert!(
        pipeline
            .records()
            .repertoire_entries(&EntryFilter::study("R1", "S1"))
            .unwrap()
            .iter()
            .all(|entry| entry.value.is_cached)
    );

    pipeline.trigger_manual_cache().unwrap();
    pipeline.run_until_idle(100);
    let study = pipeline.records().study_entry("R1", "S1").unwrap().unwrap();
    assert!(study.value.is_cached);
    assert_eq!(harness.client.download_count(), 2);
    assert_eq!(harness.links.created_count(), 4);
}

#[test]
fn oversized_study_is_split_into_partitions() {
    let mut settings = settings();
    settings.archive_cap_bytes = 1;
    let harness = Harness::with_settings(sync_repository(), settings);
    seed_s1(&harness);
    harness.pipeline.enable_and_trigger(true).unwrap();
    harness.pipeline.run_until_idle(100);

    let study = harness
        .pipeline
        .records()
        .study_entry("R1", "S1")
        .unwrap()
        .unwrap();
    let Some(Artifact::Partitioned(files)) = study.value.artifact else {
        panic!("expected a partitioned study artifact");
    };
    let names = files
        .iter()
        .map(|file| file.archive_file.as_str())
        .collect::<Vec<_>>();
    assert_eq!(names, vec!["study.tar", "study2.tar", "study3.tar"]);
    assert!(files.iter().all(|file| file.file_size.is_some()));
}
