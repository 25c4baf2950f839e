use std::collections::BTreeMap;
use std::path::PathBuf;

use clap::{Arg, ArgMatches, Args, Command, FromArgMatches};

use crate::auto::{AutoSpiderDefinition, Datatype};
use crate::error::SpiderError;
use crate::spider::SpiderOptions;

/// Flags every spider accepts.
#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct SessionArgs {
    #[arg(short = 'p', value_name = "PROJECT", help = "Project Label")]
    pub proj_label: String,

    #[arg(short = 's', value_name = "SUBJECT", help = "Subject Label")]
    pub subj_label: String,

    #[arg(short = 'e', value_name = "SESSION", help = "Session Label")]
    pub sess_label: String,

    #[arg(short = 'd', value_name = "DIR", help = "Temporary Directory")]
    pub temp_dir: PathBuf,

    #[arg(long, help = "assessor suffix. default: None")]
    pub suffix: Option<String>,

    #[arg(long, help = "Set XNAT Host. Default: using env variable XNAT_HOST")]
    pub host: Option<String>,

    #[arg(long, help = "Set XNAT User. Default: using env variable XNAT_USER")]
    pub user: Option<String>,

    #[arg(
        long = "skipfinish",
        help = "Skip the finish step, so do not move files to upload queue"
    )]
    pub skip_finish: bool,
}

impl SessionArgs {
    pub fn options(&self, spider_path: &str) -> SpiderOptions {
        let mut options = SpiderOptions::new(
            spider_path,
            &self.temp_dir,
            &self.proj_label,
            &self.subj_label,
            &self.sess_label,
        );
        options.host = self.host.clone();
        options.user = self.user.clone();
        options.suffix = self.suffix.clone();
        options.skip_finish = self.skip_finish;
        options
    }
}

/// Session flags plus the scan a scan-level spider runs on.
#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct ScanArgs {
    #[command(flatten)]
    pub session: SessionArgs,

    #[arg(short = 'c', value_name = "SCAN", help = "Scan label")]
    pub scan_label: String,
}

/// Parsed command line of an AutoSpider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoInvocation {
    pub args: SessionArgs,
    pub scan_label: Option<String>,
    pub params: BTreeMap<String, String>,
}

/// Base flags for the definition's datatype plus one required
/// `--<param>` per parameter.
pub fn auto_command(definition: &AutoSpiderDefinition) -> Result<Command, SpiderError> {
    definition.validate()?;
    let command = Command::new(definition.name.clone()).about(format!("Run {}", definition.name));
    let mut command = match definition.datatype {
        Datatype::Session => SessionArgs::augment_args(command),
        Datatype::Scan => ScanArgs::augment_args(command),
    };
    for param in &definition.params {
        command = command.arg(
            Arg::new(param.name.clone())
                .long(param.name.clone())
                .value_name(param.name.to_uppercase())
                .help(param.help.clone())
                .required(true),
        );
    }
    Ok(command)
}

pub fn parse_auto(
    definition: &AutoSpiderDefinition,
    matches: &ArgMatches,
) -> Result<AutoInvocation, SpiderError> {
    let invalid = |err: clap::Error| SpiderError::Configuration(err.to_string());
    let (args, scan_label) = match definition.datatype {
        Datatype::Session => (SessionArgs::from_arg_matches(matches).map_err(invalid)?, None),
        Datatype::Scan => {
            let scan = ScanArgs::from_arg_matches(matches).map_err(invalid)?;
            (scan.session, Some(scan.scan_label))
        }
    };
    let mut params = BTreeMap::new();
    for param in &definition.params {
        let value = matches
            .get_one::<String>(&param.name)
            .ok_or_else(|| {
                SpiderError::Configuration(format!("missing value for parameter --{}", param.name))
            })?;
        params.insert(param.name.clone(), value.clone());
    }
    Ok(AutoInvocation {
        args,
        scan_label,
        params,
    })
}

/// Builds the command for `definition` and parses `argv` (program name
/// first) against it.
pub fn parse_auto_from<I, T>(
    definition: &AutoSpiderDefinition,
    argv: I,
) -> Result<AutoInvocation, SpiderError>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    let matches = auto_command(definition)?
        .try_get_matches_from(argv)
        .map_err(|err| SpiderError::Configuration(err.to_string()))?;
    parse_auto(definition, &matches)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::domain::{ParamKind, ParamSpec};

    fn definition(datatype: Datatype) -> AutoSpiderDefinition {
        AutoSpiderDefinition {
            name: "Spider_Demo_v1.0.0".to_string(),
            datatype,
            params: vec![ParamSpec {
                name: "t1".to_string(),
                kind: ParamKind::File,
                help: "T1 image".to_string(),
            }],
            outputs: Vec::new(),
            template: "echo $t1".to_string(),
        }
    }

    #[test]
    fn session_flags_and_params() {
        let invocation = parse_auto_from(
            &definition(Datatype::Session),
            [
                "demo", "-p", "P", "-s", "S", "-e", "E", "-d", "/tmp/job", "--suffix", "v2",
                "--skipfinish", "--t1", "/data/t1.nii",
            ],
        )
        .unwrap();
        assert_eq!(invocation.args.proj_label, "P");
        assert!(invocation.args.skip_finish);
        assert_eq!(invocation.scan_label, None);
        assert_eq!(invocation.params["t1"], "/data/t1.nii");

        let options = invocation.args.options("Spider_Demo_v1.0.0");
        assert_eq!(options.suffix.as_deref(), Some("v2"));
        assert!(options.subdir);
    }

    #[test]
    fn scan_requires_scan_label() {
        let definition = definition(Datatype::Scan);
        let base = ["demo", "-p", "P", "-s", "S", "-e", "E", "-d", "/tmp/job", "--t1", "a"];
        assert_matches!(
            parse_auto_from(&definition, base),
            Err(SpiderError::Configuration(_))
        );
        let with_scan = parse_auto_from(&definition, base.iter().copied().chain(["-c", "301"])).unwrap();
        assert_eq!(with_scan.scan_label.as_deref(), Some("301"));
    }

    #[test]
    fn params_are_required() {
        assert_matches!(
            parse_auto_from(
                &definition(Datatype::Session),
                ["demo", "-p", "P", "-s", "S", "-e", "E", "-d", "/tmp/job"]
            ),
            Err(SpiderError::Configuration(_))
        );
    }
}
