//! Static name→entry table for user programs (§4.7 `exec`; §1 scopes
//! dynamic ELF loading out of this core — "user programs are statically
//! linked in and looked up by name"). The demo programs themselves live in
//! `demos`; this table is just the seam they are linked into.

use crate::demos;

pub type EntryFn = extern "C" fn() -> !;

pub struct ProgramEntry {
    pub name: &'static str,
    pub entry: EntryFn,
}

pub static PROGRAMS: &[ProgramEntry] = &[
    ProgramEntry {
        name: "hello",
        entry: demos::hello_main,
    },
    ProgramEntry {
        name: "shell",
        entry: demos::shell_main,
    },
];

pub fn lookup(name: &str) -> Option<EntryFn> {
    PROGRAMS.iter().find(|p| p.name == name).map(|p| p.entry)
}
