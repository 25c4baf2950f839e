mod common;

use std::fs;

use assert_matches::assert_matches;

use dax_spider::auto::{AutoSpider, Datatype};
use dax_spider::cli::parse_auto_from;
use dax_spider::config::{ManifestLoader, load_inputs, load_outputs};
use dax_spider::domain::{OutputKind, ParamKind};
use dax_spider::error::SpiderError;
use dax_spider::spider::Spider;

use common::StubConnector;

const MANIFEST: &str = r#"{
    "name": "Spider_Volumes_v1.0.0",
    "datatype": "scan",
    "params": [
        {"name": "t1", "kind": "FILE", "help": "T1 image"},
        {"name": "level", "kind": "VALUE"}
    ],
    "outputs": [
        {"path": "report.pdf", "kind": "FILE", "resource": "PDF"},
        {"path": "stats", "kind": "DIR", "resource": "STATS"}
    ],
    "template_file": "template.sh"
}"#;

#[test]
fn manifest_drives_the_command_line() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("template.sh"), "#!/bin/sh\necho $level\n").unwrap();
    let manifest = dir.path().join("spider.json");
    fs::write(&manifest, MANIFEST).unwrap();

    let definition = ManifestLoader::load(&manifest).unwrap();
    assert_eq!(definition.datatype, Datatype::Scan);
    assert_eq!(definition.params[1].kind, ParamKind::Value);
    assert_eq!(definition.outputs[0].kind, OutputKind::File);
    assert_eq!(definition.template, "#!/bin/sh\necho $level\n");

    let jobdir = dir.path().join("job");
    let jobdir_arg = jobdir.display().to_string();
    let invocation = parse_auto_from(
        &definition,
        [
            "Spider_Volumes_v1.0.0",
            "-p",
            "PROJ",
            "-s",
            "SUBJ",
            "-e",
            "SESS",
            "-c",
            "7",
            "-d",
            jobdir_arg.as_str(),
            "--host",
            "https://xnat.example.org",
            "--user",
            "admin",
            "--t1",
            "/data/t1.nii",
            "--level",
            "3",
        ],
    )
    .unwrap();
    assert_eq!(invocation.scan_label.as_deref(), Some("7"));

    let mut options = invocation.args.options(&definition.name);
    options.password = Some("secret".to_string());
    options.results_dir = Some(dir.path().join("results"));
    let spider = Spider::scan_with(options, "7", StubConnector::default()).unwrap();
    let auto = AutoSpider::from_spider(spider, definition, invocation.params).unwrap();

    assert_eq!(auto.src_inputs()["scan_label"], "7");
    assert_eq!(auto.src_inputs()["level"], "3");
    assert_eq!(auto.spider().proctype(), "Volumes_v1");
}

#[test]
fn broken_manifests_are_configuration_errors() {
    let dir = tempfile::tempdir().unwrap();
    let missing = ManifestLoader::load(&dir.path().join("absent.json")).unwrap_err();
    assert_matches!(missing, SpiderError::ManifestRead(_));
    assert!(missing.is_configuration());

    let manifest = dir.path().join("spider.json");
    fs::write(&manifest, r#"{"name": "Spider_X_v1.0.0", "params": []}"#).unwrap();
    let no_template = ManifestLoader::load(&manifest).unwrap_err();
    assert_matches!(no_template, SpiderError::ManifestParse(_));
    assert!(no_template.is_configuration());
}

#[test]
fn csv_definitions_load() {
    let dir = tempfile::tempdir().unwrap();
    let inputs = dir.path().join("inputs.csv");
    fs::write(&inputs, "# name,type,help\nt1,FILE,T1 image\nlevel,VALUE,smoothing level\n").unwrap();
    let outputs = dir.path().join("outputs.csv");
    fs::write(&outputs, "report.pdf,FILE,PDF\nstats,DIR,STATS\n").unwrap();

    let params = load_inputs(&inputs).unwrap();
    assert_eq!(params.len(), 2);
    assert_eq!(params[0].name, "t1");
    assert_eq!(params[1].help, "smoothing level");

    let declared = load_outputs(&outputs).unwrap();
    assert_eq!(declared[1].kind, OutputKind::Dir);
    assert_eq!(declared[1].resource, "STATS");
}
