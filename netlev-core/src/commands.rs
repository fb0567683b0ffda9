//! Host control channel grammar (§6): ASCII commands with pipe-separated parameters,
//! sent down a side channel from the task's host process rather than over the RDMA
//! wire itself. Parsed the same way `wire::FetchRequest` parses its colon-separated
//! payload - split, validate field count, parse each field by position - just with
//! `|` as the separator and a leading command name.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitMsg {
    pub num_maps: u32,
    pub job_id: String,
    pub reduce_task_id: u32,
    pub lpq_size: u32,
    pub rdma_buf_size: usize,
    pub min_rdma_buffer: usize,
    pub key_type: String,
    pub comp_codec: String,
    pub comp_block_size: usize,
    pub shuffle_memory: usize,
    pub local_dirs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchMsg {
    pub host: String,
    pub job_id: String,
    pub map_id: String,
    pub reduce_id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Init(InitMsg),
    Fetch(FetchMsg),
    Final,
    Exit,
}

#[derive(Debug, Eq, PartialEq)]
pub enum CommandError {
    UnknownCommand(String),
    MissingField { command: &'static str, field: &'static str },
    InvalidInteger { command: &'static str, field: &'static str },
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandError::UnknownCommand(name) => write!(f, "unknown command `{}`", name),
            CommandError::MissingField { command, field } => {
                write!(f, "{} missing field `{}`", command, field)
            }
            CommandError::InvalidInteger { command, field } => {
                write!(f, "{} field `{}` is not an integer", command, field)
            }
        }
    }
}

/// Parses one line of the host control channel, e.g.
/// `FETCH_MSG|host-7|job_20260731|attempt_3|2`.
pub fn parse_command(line: &str) -> Result<Command, CommandError> {
    let mut parts = line.trim_end_matches(['\r', '\n']).split('|');
    let name = parts.next().unwrap_or("");

    match name {
        "INIT_MSG" => parse_init(parts).map(Command::Init),
        "FETCH_MSG" => parse_fetch(parts).map(Command::Fetch),
        "FINAL_MSG" => Ok(Command::Final),
        "EXIT_MSG" => Ok(Command::Exit),
        other => Err(CommandError::UnknownCommand(other.to_string())),
    }
}

fn field<'a>(parts: &mut std::str::Split<'a, char>, command: &'static str, name: &'static str) -> Result<&'a str, CommandError> {
    parts.next().ok_or(CommandError::MissingField { command, field: name })
}

fn parse_int<T: std::str::FromStr>(text: &str, command: &'static str, name: &'static str) -> Result<T, CommandError> {
    text.parse().map_err(|_| CommandError::InvalidInteger { command, field: name })
}

fn parse_init(mut parts: std::str::Split<char>) -> Result<InitMsg, CommandError> {
    const C: &str = "INIT_MSG";
    let num_maps = parse_int(field(&mut parts, C, "num_maps")?, C, "num_maps")?;
    let job_id = field(&mut parts, C, "job_id")?.to_string();
    let reduce_task_id = parse_int(field(&mut parts, C, "reduce_task_id")?, C, "reduce_task_id")?;
    let lpq_size = parse_int(field(&mut parts, C, "lpq_size")?, C, "lpq_size")?;
    let rdma_buf_size = parse_int(field(&mut parts, C, "rdma_buf_size")?, C, "rdma_buf_size")?;
    let min_rdma_buffer = parse_int(field(&mut parts, C, "min_rdma_buffer")?, C, "min_rdma_buffer")?;
    let key_type = field(&mut parts, C, "key_type")?.to_string();
    let comp_codec = field(&mut parts, C, "comp_codec")?.to_string();
    let comp_block_size = parse_int(field(&mut parts, C, "comp_block_size")?, C, "comp_block_size")?;
    let shuffle_memory = parse_int(field(&mut parts, C, "shuffle_memory")?, C, "shuffle_memory")?;
    let num_local_dirs: usize = parse_int(field(&mut parts, C, "num_local_dirs")?, C, "num_local_dirs")?;

    let mut local_dirs = Vec::with_capacity(num_local_dirs);
    for _ in 0..num_local_dirs {
        local_dirs.push(field(&mut parts, C, "dir")?.to_string());
    }

    Ok(InitMsg {
        num_maps,
        job_id,
        reduce_task_id,
        lpq_size,
        rdma_buf_size,
        min_rdma_buffer,
        key_type,
        comp_codec,
        comp_block_size,
        shuffle_memory,
        local_dirs,
    })
}

fn parse_fetch(mut parts: std::str::Split<char>) -> Result<FetchMsg, CommandError> {
    const C: &str = "FETCH_MSG";
    Ok(FetchMsg {
        host: field(&mut parts, C, "host")?.to_string(),
        job_id: field(&mut parts, C, "job_id")?.to_string(),
        map_id: field(&mut parts, C, "map_id")?.to_string(),
        reduce_id: parse_int(field(&mut parts, C, "reduce_id")?, C, "reduce_id")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_msg_parses() {
        let cmd = parse_command("FETCH_MSG|host-7|job_20260731|attempt_3|2").unwrap();
        assert_eq!(
            cmd,
            Command::Fetch(FetchMsg {
                host: "host-7".into(),
                job_id: "job_20260731".into(),
                map_id: "attempt_3".into(),
                reduce_id: 2,
            })
        );
    }

    #[test]
    fn final_and_exit_take_no_fields() {
        assert_eq!(parse_command("FINAL_MSG").unwrap(), Command::Final);
        assert_eq!(parse_command("EXIT_MSG").unwrap(), Command::Exit);
    }

    #[test]
    fn init_msg_parses_variable_length_dir_list() {
        let line = "INIT_MSG|8|job_1|2|16|1048576|65536|binary|snappy|32768|268435456|2|/d0|/d1";
        let cmd = parse_command(line).unwrap();
        match cmd {
            Command::Init(init) => {
                assert_eq!(init.num_maps, 8);
                assert_eq!(init.local_dirs, vec!["/d0".to_string(), "/d1".to_string()]);
            }
            _ => panic!("expected Init"),
        }
    }

    #[test]
    fn unknown_command_is_rejected() {
        assert_eq!(parse_command("BOGUS_MSG|1").unwrap_err(), CommandError::UnknownCommand("BOGUS_MSG".into()));
    }

    #[test]
    fn fetch_msg_missing_field_is_rejected() {
        let err = parse_command("FETCH_MSG|host-7|job_1").unwrap_err();
        assert_eq!(err, CommandError::MissingField { command: "FETCH_MSG", field: "map_id" });
    }
}
