//! Local process enumeration and termination
//!
//! Detached daemons are not supervised, so the only way to find them again is
//! to scan the OS process table for matching command lines. Each platform has
//! its own lister behind [`ProcessLister`]; the output parsers are pure so
//! both can be tested on any host.

use std::io;
use std::process::{Command, Stdio};

/// One row of the process table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    pub command_line: String,
}

/// Capability to enumerate running processes
pub trait ProcessLister {
    /// All processes visible to the current user
    fn list_processes(&self) -> io::Result<Vec<ProcessEntry>>;

    /// PIDs of processes accepted by `keep`, excluding this process
    fn list_processes_where(&self, keep: &dyn Fn(&ProcessEntry) -> bool) -> io::Result<Vec<u32>> {
        let own_pid = std::process::id();
        Ok(self
            .list_processes()?
            .into_iter()
            .filter(|p| p.pid != own_pid && keep(p))
            .map(|p| p.pid)
            .collect())
    }

    /// PIDs whose command line contains every pattern, excluding this process
    fn list_processes_matching(&self, patterns: &[&str]) -> io::Result<Vec<u32>> {
        self.list_processes_where(&|p| patterns.iter().all(|pat| p.command_line.contains(pat)))
    }
}

/// Split a command line into the executable and its arguments
///
/// A leading double-quoted executable (as Windows reports paths with spaces)
/// is kept whole; everything else splits on whitespace.
pub fn command_tokens(command_line: &str) -> Vec<&str> {
    let line = command_line.trim();
    if let Some(rest) = line.strip_prefix('"') {
        if let Some((exe, args)) = rest.split_once('"') {
            let mut tokens = vec![exe];
            tokens.extend(args.split_whitespace());
            return tokens;
        }
    }
    line.split_whitespace().collect()
}

/// File name of an executable token without directory or `.exe` suffix
///
/// Both `/` and `\` count as separators so Windows paths reduce the same
/// way on every host.
pub fn executable_stem(token: &str) -> &str {
    let name = token.rsplit(|c: char| c == '/' || c == '\\').next().unwrap_or(token);
    match name.len().checked_sub(4) {
        Some(cut) if name.is_char_boundary(cut) && name[cut..].eq_ignore_ascii_case(".exe") => {
            &name[..cut]
        }
        _ => name,
    }
}

/// POSIX lister backed by `ps -eo pid=,args=`
#[derive(Debug, Clone, Copy, Default)]
pub struct PsLister;

impl ProcessLister for PsLister {
    fn list_processes(&self) -> io::Result<Vec<ProcessEntry>> {
        let output = Command::new("ps")
            .args(["-eo", "pid=,args="])
            .stdin(Stdio::null())
            .output()?;

        if !output.status.success() {
            return Err(io::Error::other(format!(
                "ps exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(parse_ps_output(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Parse `ps -eo pid=,args=` output: a right-aligned PID, then the command line
pub fn parse_ps_output(output: &str) -> Vec<ProcessEntry> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim_start();
            let (pid, args) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
            let pid = pid.parse::<u32>().ok()?;
            let command_line = args.trim().to_string();
            (!command_line.is_empty()).then_some(ProcessEntry { pid, command_line })
        })
        .collect()
}

/// Windows lister backed by `Get-CimInstance Win32_Process`
#[derive(Debug, Clone, Copy, Default)]
pub struct CimLister;

const CIM_QUERY: &str = "Get-CimInstance Win32_Process | Select-Object ProcessId,CommandLine | ConvertTo-Csv -NoTypeInformation";

impl ProcessLister for CimLister {
    fn list_processes(&self) -> io::Result<Vec<ProcessEntry>> {
        let output = Command::new("powershell")
            .args(["-NoProfile", "-NonInteractive", "-Command", CIM_QUERY])
            .stdin(Stdio::null())
            .output()?;

        if !output.status.success() {
            return Err(io::Error::other(format!(
                "powershell exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(parse_cim_csv(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Parse the CSV produced by [`CIM_QUERY`]: `"ProcessId","CommandLine"` rows
pub fn parse_cim_csv(output: &str) -> Vec<ProcessEntry> {
    output
        .lines()
        .filter_map(|line| {
            let fields = split_csv_line(line.trim_end_matches('\r'));
            let [pid, command_line] = fields.as_slice() else {
                return None;
            };
            let pid = pid.trim().parse::<u32>().ok()?;
            let command_line = command_line.trim().to_string();
            (!command_line.is_empty()).then_some(ProcessEntry { pid, command_line })
        })
        .collect()
}

/// Split one CSV record, honoring quotes and doubled-quote escapes
fn split_csv_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => fields.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    fields.push(current);
    fields
}

/// Lister for the current platform
#[cfg(windows)]
pub type SystemProcessLister = CimLister;

/// Lister for the current platform
#[cfg(not(windows))]
pub type SystemProcessLister = PsLister;

/// Ask a process to terminate
///
/// On Unix, sends SIGTERM so the daemon can unregister its connections.
/// On Windows, uses TerminateProcess.
#[cfg(unix)]
pub fn terminate_process(pid: u32) -> io::Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    // SAFETY: kill has no memory-safety preconditions
    let result = unsafe { libc::kill(pid, libc::SIGTERM) };
    if result == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(windows)]
pub fn terminate_process(pid: u32) -> io::Result<()> {
    use windows_sys::Win32::Foundation::CloseHandle;
    use windows_sys::Win32::System::Threading::{OpenProcess, TerminateProcess, PROCESS_TERMINATE};

    unsafe {
        let handle = OpenProcess(PROCESS_TERMINATE, 0, pid);
        if handle == 0 {
            return Err(io::Error::last_os_error());
        }
        let ok = TerminateProcess(handle, 1);
        let err = io::Error::last_os_error();
        CloseHandle(handle);
        if ok == 0 {
            return Err(err);
        }
    }
    Ok(())
}

/// Check if a process with the given PID is still alive
///
/// On Unix, uses kill(pid, 0) to check if the process exists.
/// On Windows, uses OpenProcess to check if the process exists.
#[cfg(unix)]
pub fn is_process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // ESRCH means no such process; EPERM means it exists but belongs to someone else
    unsafe {
        if libc::kill(pid, 0) == 0 {
            return true;
        }
        io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
}

#[cfg(windows)]
pub fn is_process_alive(pid: u32) -> bool {
    use windows_sys::Win32::Foundation::CloseHandle;
    use windows_sys::Win32::System::Threading::{OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION};

    unsafe {
        let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid);
        if handle == 0 {
            return false;
        }
        CloseHandle(handle);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PS_FIXTURE: &str = "    1 /sbin/init splash
  812 /usr/sbin/sshd -D
 4242 /usr/local/bin/cloudflared tunnel --config /home/u/.config/flaretun/tunnels/6ff42ae2-765d-4adf-8112-31c55c1551ef.yml run
 4250 [kworker/0:1-events]
 5001 vim notes.txt
 9999
garbage line
";

    const CIM_FIXTURE: &str = "\"ProcessId\",\"CommandLine\"\r
\"0\",\"\"\r
\"4\",\r
\"3120\",\"\"\"C:\\Program Files\\cloudflared\\cloudflared.exe\"\" tunnel --config C:\\Users\\u\\AppData\\Roaming\\flaretun\\tunnels\\6ff42ae2-765d-4adf-8112-31c55c1551ef.yml run\"\r
\"7788\",\"notepad.exe C:\\notes, draft.txt\"\r
";

    struct FixedLister(Vec<ProcessEntry>);

    impl ProcessLister for FixedLister {
        fn list_processes(&self) -> io::Result<Vec<ProcessEntry>> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn test_parse_ps_output() {
        let entries = parse_ps_output(PS_FIXTURE);
        let pids: Vec<u32> = entries.iter().map(|e| e.pid).collect();
        assert_eq!(pids, [1, 812, 4242, 4250, 5001]);
        assert!(entries[2].command_line.starts_with("/usr/local/bin/cloudflared tunnel"));
        assert!(entries[2].command_line.ends_with(".yml run"));
    }

    #[test]
    fn test_parse_cim_csv() {
        let entries = parse_cim_csv(CIM_FIXTURE);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].pid, 3120);
        assert!(entries[0]
            .command_line
            .starts_with("\"C:\\Program Files\\cloudflared\\cloudflared.exe\" tunnel"));
        assert_eq!(entries[1].command_line, "notepad.exe C:\\notes, draft.txt");
    }

    #[test]
    fn test_listers_agree_on_matches() {
        let id = "6ff42ae2-765d-4adf-8112-31c55c1551ef";
        let posix = FixedLister(parse_ps_output(PS_FIXTURE));
        let windows = FixedLister(parse_cim_csv(CIM_FIXTURE));

        assert_eq!(
            posix.list_processes_matching(&["cloudflared", id]).unwrap(),
            [4242]
        );
        assert_eq!(
            windows.list_processes_matching(&["cloudflared", id]).unwrap(),
            [3120]
        );
        assert!(posix
            .list_processes_matching(&["cloudflared", "other-id"])
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_matching_excludes_current_process() {
        let lister = FixedLister(vec![
            ProcessEntry {
                pid: std::process::id(),
                command_line: "flaretun stop --tunnel abc cloudflared".to_string(),
            },
            ProcessEntry {
                pid: 77,
                command_line: "cloudflared tunnel --config abc.yml run".to_string(),
            },
        ]);
        assert_eq!(lister.list_processes_matching(&["cloudflared", "abc"]).unwrap(), [77]);
    }

    #[test]
    fn test_command_tokens() {
        assert_eq!(
            command_tokens("\"C:\\Program Files\\cloudflared\\cloudflared.exe\" tunnel run"),
            ["C:\\Program Files\\cloudflared\\cloudflared.exe", "tunnel", "run"]
        );
        assert_eq!(command_tokens("  vim  notes.txt "), ["vim", "notes.txt"]);
        assert!(command_tokens("").is_empty());
    }

    #[test]
    fn test_executable_stem() {
        assert_eq!(executable_stem("/usr/local/bin/cloudflared"), "cloudflared");
        assert_eq!(executable_stem("C:\\Program Files\\cloudflared\\cloudflared.EXE"), "cloudflared");
        assert_eq!(executable_stem("cloudflared"), "cloudflared");
        assert_eq!(executable_stem("/bin/sh"), "sh");
        assert_eq!(executable_stem(".exe"), "");
    }

    #[test]
    fn test_list_processes_where() {
        let lister = FixedLister(parse_ps_output(PS_FIXTURE));
        let pids = lister
            .list_processes_where(&|p| p.command_line.starts_with("/usr"))
            .unwrap();
        assert_eq!(pids, [812, 4242]);
    }

    #[test]
    fn test_split_csv_line() {
        assert_eq!(split_csv_line(r#""a","b,c","d""e""#), ["a", "b,c", "d\"e"]);
        assert_eq!(split_csv_line("1,"), ["1", ""]);
    }

    #[test]
    fn test_current_process_is_alive() {
        assert!(is_process_alive(std::process::id()));
    }

    #[test]
    fn test_invalid_pid_not_alive() {
        assert!(!is_process_alive(999_999_999));
    }

    #[cfg(unix)]
    #[test]
    fn test_system_lister_sees_current_process() {
        let entries = SystemProcessLister::default().list_processes().unwrap();
        assert!(entries.iter().any(|e| e.pid == std::process::id()));
    }
}
