//! Definition file parser.
//!
//! The file is line-oriented: `[SECTION]` headers introduce sections, `#`
//! starts a comment line, and each section body is a whitespace-aligned
//! table. Columns are separated by two or more spaces (or a tab); a `•`
//! cell is an explicit empty value; a trailing `¶` cell collects the
//! following indented lines as a multi-line value.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, Duration, Local, NaiveDateTime};
use regex::Regex;

use crate::message;
use crate::vars::TemplateString;

use super::{
    BulletinDef, CondOp, Condition, Definition, DefinitionError, EventDef, EventType, Exercise,
    FormValidation, MatchReceive, MessageDef, Station, PACK_IT_FORMS,
};

static SECT_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\[([^\]]+)\]\s*(?:#.*)?$").unwrap());
static MULTISPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r" [ \t]+|\t[ \t]*").unwrap());
static FCC_CALL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:A[A-L][0-9][A-Z]{1,3}|[KNW][0-9][A-Z]{2,3}|[KNW][A-Z][0-9][A-Z]{1,3})$")
        .unwrap()
});
static MSG_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:[A-Z][A-Z0-9]{2}|[0-9][A-Z]{2})-[0-9]{3,}[AC-HJ-NPR-Y]$").unwrap());
static PREFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:[A-Z][A-Z0-9]{2}|[0-9][A-Z]{2})$").unwrap());
static TAC_CALL_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Z][A-Z0-9]{3,}$").unwrap());
static MSG_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_]*$").unwrap());
static CONDITION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^((?:exercise|station)\.[A-Za-z][-A-Za-z0-9_]*|[A-Za-z][A-Za-z0-9_]*\.(?:msgid|subjectline|time))\s*(=|!=|<|<=|>|>=|≈)\s*(\S.*)$",
    )
    .unwrap()
});

type SectionResult = Result<(), (usize, String)>;

struct Section {
    name: String,
    start_line: usize,
    end_line: usize,
    table: Vec<Vec<String>>,
}

/// Load and validate the definition file.
pub fn load(filename: &str) -> Result<Definition, DefinitionError> {
    let contents = std::fs::read_to_string(filename).map_err(|err| DefinitionError::Io {
        file: filename.to_owned(),
        err,
    })?;
    parse(&contents, filename)
}

pub(crate) fn parse(contents: &str, filename: &str) -> Result<Definition, DefinitionError> {
    let syntax = |(line, detail): (usize, String)| DefinitionError::Syntax {
        file: filename.to_owned(),
        line,
        detail,
    };
    let invalid = |detail: String| DefinitionError::Invalid {
        file: filename.to_owned(),
        detail,
    };

    let normalized = contents.replace("\r\n", "\n").replace('\r', "");
    let lines: Vec<&str> = normalized.split('\n').collect();
    let mut sections = split_sections(&lines).map_err(syntax)?;
    for s in &mut sections {
        let keyvalue = s.name == "EXERCISE"
            || s.name.starts_with("SEND ")
            || s.name.starts_with("RECEIVE ");
        s.table =
            parse_table(&lines[s.start_line..s.end_line], s.start_line + 1, keyvalue)
                .map_err(syntax)?;
    }

    let mut def = Definition {
        filename: filename.to_owned(),
        exercise: Exercise::default(),
        form_validation: HashMap::new(),
        stations: Vec::new(),
        events: Vec::new(),
        match_receive: Vec::new(),
        bulletins: HashMap::new(),
        sends: HashMap::new(),
        receives: HashMap::new(),
    };
    let mut have = HashMap::new();
    for s in &sections {
        if have.insert(s.name.clone(), true).is_some() {
            return Err(syntax((
                s.start_line,
                format!("already have a [{}] section", s.name),
            )));
        }
        let start = s.start_line + 1;
        match s.name.as_str() {
            "EXERCISE" => parse_exercise(&mut def, &s.table, start).map_err(syntax)?,
            "FORM VALIDATION" => parse_form_validation(&mut def, &s.table, start).map_err(syntax)?,
            "STATIONS" => parse_stations(&mut def, &s.table, start).map_err(syntax)?,
            "EVENTS" => parse_events(&mut def, &s.table, start).map_err(syntax)?,
            "MATCH RECEIVE" => parse_match_receive(&mut def, &s.table, start).map_err(syntax)?,
            name => {
                if let Some(msgname) = name.strip_prefix("BULLETIN ") {
                    parse_bulletin(&mut def, msgname, &s.table, start).map_err(syntax)?;
                } else if let Some(msgname) = name.strip_prefix("SEND ") {
                    let m = parse_message(name, msgname, &s.table, start, false).map_err(syntax)?;
                    def.sends.insert(msgname.to_owned(), m);
                } else if let Some(msgname) = name.strip_prefix("RECEIVE ") {
                    let m = parse_message(name, msgname, &s.table, start, true).map_err(syntax)?;
                    def.receives.insert(msgname.to_owned(), m);
                } else {
                    return Err(syntax((s.start_line, format!("unknown section [{name}]"))));
                }
            }
        }
    }
    if def.exercise.my_call.is_empty() {
        return Err(invalid("[EXERCISE] section is required".into()));
    }
    if def.stations.is_empty() {
        return Err(invalid("[STATIONS] section is required".into()));
    }
    if def.events.is_empty() {
        return Err(invalid("[EVENTS] section is required".into()));
    }
    if def.match_receive.is_empty() && !def.receives.is_empty() {
        return Err(invalid("[MATCH RECEIVE] section is required".into()));
    }
    verify_cross_references(&def).map_err(invalid)?;
    Ok(def)
}

fn split_sections(lines: &[&str]) -> Result<Vec<Section>, (usize, String)> {
    let mut sections: Vec<Section> = Vec::new();
    for (lnum, line) in lines.iter().enumerate() {
        if line.starts_with('[') {
            let caps = SECT_NAME_RE
                .captures(line)
                .ok_or((lnum + 1, "syntax error on [SECTION] line".to_owned()))?;
            sections.push(Section {
                name: caps[1].to_owned(),
                start_line: lnum + 1,
                end_line: lnum + 1,
                table: Vec::new(),
            });
            continue;
        }
        if line.starts_with('#') || line.trim().is_empty() {
            continue;
        }
        match sections.last_mut() {
            None => return Err((lnum + 1, "text before first [SECTION] line".to_owned())),
            Some(s) => s.end_line = lnum + 1,
        }
    }
    Ok(sections)
}

fn parse_table(
    lines: &[&str],
    start: usize,
    keyvalue: bool,
) -> Result<Vec<Vec<String>>, (usize, String)> {
    let mut table: Vec<Vec<String>> = if keyvalue {
        vec![vec!["key".to_owned(), "value".to_owned()]]
    } else {
        Vec::new()
    };
    // 0 = no continuation active, -1 = detect indent on next line, >0 = the
    // continuation indent in columns.
    let mut indent: i64 = 0;
    for (lnum, raw) in lines.iter().enumerate() {
        let lnum = lnum + start;
        if raw.is_empty() || raw.starts_with(' ') || raw.starts_with('\t') {
            if indent == 0 {
                return Err((lnum, "indented text without ¶ mark".to_owned()));
            }
            let line = expand_initial_tabs(raw);
            let nonblank = line.find(|c| c != ' ');
            let mut text = String::new();
            match nonblank {
                None if indent < 0 => {
                    return Err((lnum, "line after ¶ must contain indented text".to_owned()));
                }
                None => {}
                Some(nb) if indent < 0 => {
                    indent = nb as i64;
                    text = line[nb..].to_owned();
                }
                Some(nb) if (nb as i64) < indent => {
                    return Err((
                        lnum,
                        "line is indented less than first line in ¶ section".to_owned(),
                    ));
                }
                Some(_) => text = line[indent as usize..].to_owned(),
            }
            let row = table.last_mut().expect("¶ without a prior row");
            let cell = row.last_mut().expect("¶ row without columns");
            cell.push_str(&text);
            cell.push('\n');
            continue;
        }
        indent = 0;
        let mut columns: Vec<String> = MULTISPACE_RE
            .split(raw)
            .map(str::to_owned)
            .collect();
        // Chop at the first empty or comment column; a bullet is an explicit
        // empty value.
        for i in 0..columns.len() {
            if columns[i].is_empty() || columns[i].starts_with('#') {
                columns.truncate(i);
                break;
            }
            if columns[i] == "•" {
                columns[i] = String::new();
            }
        }
        if columns.last().map(String::as_str) == Some("¶") {
            indent = -1;
            *columns.last_mut().unwrap() = String::new();
        }
        if columns.iter().any(|c| c == "¶") {
            return Err((
                lnum,
                "indented text with ¶ can only be used in the rightmost column".to_owned(),
            ));
        }
        if !table.is_empty() && columns.len() != table[0].len() {
            return Err((
                lnum,
                format!(
                    "line has {} columns; expected {}",
                    columns.len(),
                    table[0].len()
                ),
            ));
        }
        table.push(columns);
    }
    if keyvalue {
        table.remove(0);
    }
    Ok(table)
}

/// Expand tabs in the leading whitespace of a line, 8-column tab stops.
fn expand_initial_tabs(s: &str) -> String {
    let mut expanded = String::new();
    let mut col = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            ' ' => {
                expanded.push(' ');
                col += 1;
            }
            '\t' => {
                let width = ((col + 8) & !7) - col;
                expanded.push_str(&"        "[..width]);
                col += width;
            }
            _ => {
                expanded.push_str(&s[i..]);
                return expanded;
            }
        }
    }
    expanded
}

fn ascii(s: &str) -> bool {
    s.chars()
        .all(|c| (' '..='\x7f').contains(&c) || c == '\t' || c == '\n')
}

/// Like `ascii` but admits `¡`, the marker receive templates use for fields
/// the operator must fill in by hand.
fn ascii_or_bang(s: &str) -> bool {
    s.chars()
        .all(|c| (' '..='\x7f').contains(&c) || c == '\t' || c == '\n' || c == '¡')
}

fn host_port(s: &str) -> bool {
    match s.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
        None => false,
    }
}

fn email_address(s: &str) -> bool {
    match s.split_once('@') {
        Some((local, domain)) => !local.is_empty() && domain.contains('.'),
        None => false,
    }
}

fn local_datetime(s: &str, fmt: &str) -> Option<DateTime<Local>> {
    let naive = NaiveDateTime::parse_from_str(s, fmt).ok()?;
    naive.and_local_timezone(Local).earliest()
}

fn parse_exercise(def: &mut Definition, table: &[Vec<String>], start: usize) -> SectionResult {
    let ex = &mut def.exercise;
    for (lnum, line) in table.iter().enumerate() {
        let lnum = lnum + start;
        if line.is_empty() {
            continue;
        }
        let (key, value) = (line[0].as_str(), line[1].as_str());
        if !ascii(value) {
            return Err((lnum, "value is not ASCII".to_owned()));
        }
        match key {
            "listenaddr" => {
                if !host_port(value) {
                    return Err((lnum, "listenaddr must be in host:port format".to_owned()));
                }
                ex.listen_addr = value.to_owned();
            }
            "incident" => ex.incident = value.to_owned(),
            "activation" => ex.activation = value.to_owned(),
            "opstart" => {
                ex.op_start = Some(local_datetime(value, "%m/%d/%Y %H:%M").ok_or((
                    lnum,
                    "opstart must have format MM/DD/YYYY HH:MM".to_owned(),
                ))?);
            }
            "opend" => {
                ex.op_end = Some(local_datetime(value, "%m/%d/%Y %H:%M").ok_or((
                    lnum,
                    "opend must have format MM/DD/YYYY HH:MM".to_owned(),
                ))?);
            }
            "mycall" => {
                if !TAC_CALL_RE.is_match(value) {
                    return Err((
                        lnum,
                        "mycall is not a valid FCC or tactical call sign".to_owned(),
                    ));
                }
                ex.my_call = value.to_owned();
            }
            "myname" => ex.my_name = value.to_owned(),
            "myposition" => ex.my_position = value.to_owned(),
            "mylocation" => ex.my_location = value.to_owned(),
            "opcall" => {
                if !FCC_CALL_RE.is_match(value) {
                    return Err((lnum, "opcall is not a valid FCC call sign".to_owned()));
                }
                ex.op_call = value.to_owned();
            }
            "opname" => ex.op_name = value.to_owned(),
            "bbsname" => {
                if !FCC_CALL_RE.is_match(value) {
                    return Err((lnum, "bbsname is not a valid FCC call sign".to_owned()));
                }
                ex.bbs_name = value.to_owned();
            }
            "bbsaddress" => {
                if !host_port(value) {
                    return Err((
                        lnum,
                        "bbsaddress is not a valid hostname:portnum or ipaddress:portnum"
                            .to_owned(),
                    ));
                }
                ex.bbs_address = value.to_owned();
            }
            "bbspassword" => {
                ex.bbs_password = value.to_owned();
                continue; // not exposed as a variable
            }
            "emailfrom" => {
                if !email_address(value) {
                    return Err((lnum, "emailfrom is not a valid email address".to_owned()));
                }
                ex.email_from = value.to_owned();
            }
            "smtpaddress" => {
                if !host_port(value) {
                    return Err((
                        lnum,
                        "smtpaddress is not a valid hostname:portnum or ipaddress:portnum"
                            .to_owned(),
                    ));
                }
                ex.smtp_address = value.to_owned();
            }
            "smtpuser" => ex.smtp_user = value.to_owned(),
            "smtppassword" => {
                ex.smtp_password = value.to_owned();
                continue; // not exposed as a variable
            }
            "startmsgid" => {
                if !MSG_ID_RE.is_match(value) {
                    return Err((
                        lnum,
                        "startmsgid is not a valid XXX-###P message ID".to_owned(),
                    ));
                }
                ex.start_msg_id = value.to_owned();
            }
            _ => {}
        }
        ex.variables.insert(key.to_owned(), value.to_owned());
    }
    if let (Some(op_start), Some(op_end)) = (ex.op_start, ex.op_end) {
        if op_end < op_start {
            return Err((start - 1, "opend must be after opstart".to_owned()));
        }
    }
    if ex.my_call.is_empty() || ex.my_name.is_empty() {
        return Err((start - 1, "mycall and myname are required".to_owned()));
    }
    if ex.op_call.is_empty() || ex.op_name.is_empty() {
        return Err((start - 1, "opcall and opname are required".to_owned()));
    }
    if ex.bbs_name.is_empty() || ex.bbs_address.is_empty() || ex.bbs_password.is_empty() {
        return Err((
            start - 1,
            "bbsname, bbsaddress, and bbspassword are required".to_owned(),
        ));
    }
    let smtp = [&ex.smtp_address, &ex.smtp_user, &ex.smtp_password];
    if smtp.iter().any(|s| !s.is_empty()) && smtp.iter().any(|s| s.is_empty()) {
        return Err((
            start - 1,
            "specify all or none of smtpaddress, smtpuser, and smtppassword".to_owned(),
        ));
    }
    if ex.start_msg_id.is_empty() {
        return Err((start - 1, "startmsgid is required".to_owned()));
    }
    Ok(())
}

fn column_index(headings: &[String], name: &str) -> Option<usize> {
    headings.iter().position(|h| h == name)
}

fn parse_form_validation(
    def: &mut Definition,
    table: &[Vec<String>],
    start: usize,
) -> SectionResult {
    let Some(headings) = table.first() else {
        return Err((start, "table must begin with column headings".to_owned()));
    };
    for h in headings {
        if !matches!(
            h.as_str(),
            "tag" | "minver" | "handling" | "toposition" | "tolocation"
        ) {
            return Err((start, format!("unknown column {h:?}")));
        }
    }
    let tag_col =
        column_index(headings, "tag").ok_or((start, "table must contain column \"tag\"".to_owned()))?;
    for (lnum, line) in table[1..].iter().enumerate() {
        let lnum = lnum + start + 1;
        if line.is_empty() {
            continue;
        }
        if let Some(bad) = line.iter().position(|c| !ascii(c)) {
            return Err((lnum, format!("{} value is not ASCII", headings[bad])));
        }
        let tag = &line[tag_col];
        if def.form_validation.contains_key(tag) {
            return Err((lnum, format!("multiple lines with tag {tag:?}")));
        }
        if tag != PACK_IT_FORMS && !message::is_registered(tag) {
            return Err((lnum, format!("unknown form tag {tag:?}")));
        }
        let mut fv = FormValidation::default();
        if let Some(i) = column_index(headings, "minver") {
            fv.min_ver = line[i].clone();
        }
        if let Some(i) = column_index(headings, "handling") {
            match line[i].as_str() {
                "" | "IMMEDIATE" | "PRIORITY" | "ROUTINE" => {}
                "computed" => {
                    if tag != "EOC213RR" && tag != "ICS213" {
                        return Err((lnum, format!("handling cannot be computed for {tag}")));
                    }
                }
                other => return Err((lnum, format!("unknown handling order {other:?}"))),
            }
            fv.handling = line[i].clone();
        }
        if let Some(i) = column_index(headings, "toposition") {
            fv.to_position = comma_split(&line[i]);
        }
        if let Some(i) = column_index(headings, "tolocation") {
            fv.to_location = comma_split(&line[i]);
        }
        def.form_validation.insert(tag.clone(), fv);
    }
    Ok(())
}

fn parse_stations(def: &mut Definition, table: &[Vec<String>], start: usize) -> SectionResult {
    let Some(headings) = table.first() else {
        return Err((start, "table must begin with column headings".to_owned()));
    };
    let callsign_col = column_index(headings, "callsign")
        .ok_or((start, "table must contain column \"callsign\"".to_owned()))?;
    for (lnum, line) in table[1..].iter().enumerate() {
        let lnum = lnum + start + 1;
        if let Some(bad) = line.iter().position(|c| !ascii(c)) {
            return Err((lnum, format!("{} value is not ASCII", headings[bad])));
        }
        if def.stations.iter().any(|s| s.call_sign == line[callsign_col]) {
            return Err((
                lnum,
                format!("multiple lines with callsign {:?}", line[callsign_col]),
            ));
        }
        let mut stn = Station::default();
        if !TAC_CALL_RE.is_match(&line[callsign_col]) {
            return Err((
                lnum,
                "callsign column does not contain a valid tactical or FCC call sign".to_owned(),
            ));
        }
        stn.call_sign = line[callsign_col].clone();
        if let Some(i) = column_index(headings, "prefix") {
            if !line[i].is_empty() && !PREFIX_RE.is_match(&line[i]) {
                return Err((
                    lnum,
                    "prefix column does not contain a valid message ID prefix".to_owned(),
                ));
            }
            stn.prefix = line[i].clone();
        }
        if let Some(i) = column_index(headings, "fcccall") {
            if !line[i].is_empty() && !FCC_CALL_RE.is_match(&line[i]) {
                return Err((
                    lnum,
                    "fcccall column does not contain a valid FCC call sign".to_owned(),
                ));
            }
            stn.fcc_call = line[i].clone();
        }
        if let Some(i) = column_index(headings, "inject") {
            if !line[i].is_empty() && line[i] != "print" && !email_address(&line[i]) {
                return Err((
                    lnum,
                    "inject column does not contain \"print\" or a valid email address".to_owned(),
                ));
            }
            stn.inject = line[i].clone();
        }
        if let Some(i) = column_index(headings, "position") {
            stn.position = line[i].clone();
        }
        if let Some(i) = column_index(headings, "location") {
            stn.location = line[i].clone();
        }
        if let Some(i) = column_index(headings, "receipt") {
            if !line[i].is_empty() {
                if line[i].eq_ignore_ascii_case("NONE") {
                    stn.no_receipts = true;
                } else {
                    match super::parse_duration(&line[i]) {
                        Some(d) if d > Duration::zero() => stn.receipt_delay = d,
                        _ => {
                            return Err((
                                lnum,
                                "receipt column does not contain a valid duration".to_owned(),
                            ));
                        }
                    }
                }
            }
        }
        for (i, h) in headings.iter().enumerate() {
            stn.variables.insert(h.clone(), line[i].clone());
        }
        def.stations.push(stn);
    }
    Ok(())
}

fn parse_events(def: &mut Definition, table: &[Vec<String>], start: usize) -> SectionResult {
    let Some(headings) = table.first() else {
        return Err((start, "table must begin with column headings".to_owned()));
    };
    for h in headings {
        if !matches!(
            h.as_str(),
            "group" | "type" | "name" | "trigger" | "delay" | "react" | "condition"
        ) {
            return Err((start, format!("unknown column {h:?}")));
        }
    }
    let (Some(type_col), Some(name_col), Some(trigger_col)) = (
        column_index(headings, "type"),
        column_index(headings, "name"),
        column_index(headings, "trigger"),
    ) else {
        return Err((
            start,
            "table must contain \"type\", \"name\", and \"trigger\" columns".to_owned(),
        ));
    };
    for (lnum, line) in table[1..].iter().enumerate() {
        let lnum = lnum + start + 1;
        if let Some(bad) = line.iter().position(|c| !ascii(c)) {
            return Err((lnum, format!("{} value is not ASCII", headings[bad])));
        }
        let etype = match line[type_col].as_str() {
            "inject" => EventType::Inject,
            "receive" => EventType::Receive,
            "bulletin" => EventType::Bulletin,
            "send" => EventType::Send,
            "deliver" => EventType::Deliver,
            "alert" => EventType::Alert,
            other => return Err((lnum, format!("invalid event type {other:?}"))),
        };
        let name = line[name_col].clone();
        if name.is_empty() {
            return Err((lnum, "event name is required".to_owned()));
        }
        if !MSG_NAME_RE.is_match(&name) {
            return Err((lnum, "invalid message name".to_owned()));
        }
        if def.events.iter().any(|e| e.etype == etype && e.name == name) {
            return Err((lnum, format!("multiple lines for {etype} {name:?}")));
        }
        let (trigger_type, trigger_name) = match line[trigger_col].as_str() {
            "" => match def.events.last() {
                None => {
                    return Err((
                        lnum,
                        "trigger is required when there is no previous line".to_owned(),
                    ));
                }
                Some(prev) => (prev.etype, prev.name.clone()),
            },
            "start" => (EventType::Start, String::new()),
            "manual" => (EventType::Manual, String::new()),
            trigger => {
                let (tt, tn) = trigger
                    .split_once(' ')
                    .and_then(|(t, n)| Some((EventType::from_str(t).ok()?, n)))
                    .ok_or((lnum, format!("invalid trigger {trigger:?}")))?;
                if !matches!(
                    tt,
                    EventType::Inject
                        | EventType::Receive
                        | EventType::Send
                        | EventType::Bulletin
                        | EventType::Deliver
                        | EventType::Alert
                ) || !MSG_NAME_RE.is_match(tn)
                {
                    return Err((lnum, format!("invalid trigger {trigger:?}")));
                }
                (tt, tn.to_owned())
            }
        };
        if etype == EventType::Bulletin
            && trigger_type != EventType::Start
            && trigger_type != EventType::Manual
        {
            return Err((
                lnum,
                "bulletins can only be triggered by start or manual".to_owned(),
            ));
        }
        let mut delay = Duration::zero();
        if let Some(i) = column_index(headings, "delay") {
            if !line[i].is_empty() {
                delay = super::parse_duration(&line[i])
                    .ok_or((lnum, format!("invalid delay {:?}", line[i])))?;
            }
        }
        let mut condition = None;
        if let Some(i) = column_index(headings, "condition") {
            if !line[i].is_empty() {
                let caps = CONDITION_RE
                    .captures(&line[i])
                    .ok_or((lnum, "syntax error in condition".to_owned()))?;
                let op = CondOp::parse(&caps[2]).expect("operator matched by pattern");
                let re = if op == CondOp::Matches {
                    Some(Regex::new(&caps[3]).map_err(|_| {
                        (
                            lnum,
                            "syntax error in condition regular expression".to_owned(),
                        )
                    })?)
                } else {
                    None
                };
                condition = Some(Condition {
                    var: caps[1].to_owned(),
                    op,
                    val: if re.is_some() {
                        String::new()
                    } else {
                        caps[3].to_owned()
                    },
                    re,
                });
            }
        }
        let group = column_index(headings, "group")
            .map(|i| line[i].clone())
            .unwrap_or_default();
        let event = EventDef {
            group,
            etype,
            name,
            trigger_type,
            trigger_name,
            delay,
            condition,
        };
        let react_delay = match column_index(headings, "react") {
            Some(i) if !line[i].is_empty() => Some(
                super::parse_duration(&line[i])
                    .ok_or((lnum, format!("invalid react {:?}", line[i])))?,
            ),
            _ => None,
        };
        def.events.push(event.clone());
        if let Some(react) = react_delay {
            // `react` auto-defines the paired response event: the receive we
            // expect after an inject, or the deliver after a bulletin/send.
            let paired_type = match event.etype {
                EventType::Inject => EventType::Receive,
                EventType::Bulletin | EventType::Send => EventType::Deliver,
                _ => {
                    return Err((
                        lnum,
                        format!("{} events do not support react values", event.etype),
                    ));
                }
            };
            def.events.push(EventDef {
                etype: paired_type,
                trigger_type: event.etype,
                trigger_name: event.name.clone(),
                delay: react,
                condition: None,
                ..event
            });
        }
    }
    for e in &def.events {
        if !e.trigger_name.is_empty()
            && !def
                .events
                .iter()
                .any(|e2| e2.etype == e.trigger_type && e2.name == e.trigger_name)
        {
            return Err((
                start - 1,
                format!(
                    "{} {} is triggered by nonexistent event {} {}",
                    e.etype, e.name, e.trigger_type, e.trigger_name
                ),
            ));
        }
    }
    Ok(())
}

fn parse_match_receive(def: &mut Definition, table: &[Vec<String>], start: usize) -> SectionResult {
    let Some(headings) = table.first() else {
        return Err((start, "table must begin with column headings".to_owned()));
    };
    for h in headings {
        if !matches!(h.as_str(), "name" | "type" | "subject" | "subjectre" | "subjectRE") {
            return Err((start, format!("unknown column {h:?}")));
        }
    }
    let name_col = column_index(headings, "name")
        .ok_or((start, "table must contain \"name\" column".to_owned()))?;
    let type_col = column_index(headings, "type");
    let subject_col = column_index(headings, "subject");
    let subject_re_col =
        column_index(headings, "subjectre").or_else(|| column_index(headings, "subjectRE"));
    if type_col.is_none() && subject_col.is_none() && subject_re_col.is_none() {
        return Err((
            start,
            "table must contain at least one of the \"type\", \"subject\", or \"subjectRE\" columns"
                .to_owned(),
        ));
    }
    for (lnum, line) in table[1..].iter().enumerate() {
        let lnum = lnum + start + 1;
        if line.is_empty() {
            continue;
        }
        let name = line[name_col].clone();
        if name.is_empty() {
            return Err((lnum, "name column must have a value".to_owned()));
        }
        if !MSG_NAME_RE.is_match(&name) {
            return Err((lnum, "invalid message name".to_owned()));
        }
        if def.match_receive.iter().any(|m| m.name == name) {
            return Err((lnum, format!("multiple lines for message {name:?}")));
        }
        let mut mr = MatchReceive {
            name,
            mtype: String::new(),
            subject: String::new(),
            subject_re: None,
        };
        if let Some(i) = type_col {
            if !line[i].is_empty() && !message::is_registered(&line[i]) {
                return Err((lnum, format!("{:?} is not a known message type", line[i])));
            }
            mr.mtype = line[i].clone();
        }
        if let Some(i) = subject_col {
            if !ascii(&line[i]) {
                return Err((lnum, "subject value is not ASCII".to_owned()));
            }
            mr.subject = line[i].clone();
        }
        if let Some(i) = subject_re_col {
            if !line[i].is_empty() {
                if !ascii(&line[i]) {
                    return Err((lnum, "subjectRE value is not ASCII".to_owned()));
                }
                // Subject patterns are implicitly anchored and
                // case-insensitive.
                mr.subject_re = Some(Regex::new(&format!("^(?i:{})$", line[i])).map_err(
                    |_| {
                        (
                            lnum,
                            "subjectRE value is not a valid regular expression".to_owned(),
                        )
                    },
                )?);
            }
        }
        if mr.mtype.is_empty() && mr.subject.is_empty() && mr.subject_re.is_none() {
            return Err((
                lnum,
                format!(
                    "line for {} must have a type, a subject, and/or a subjectRE",
                    mr.name
                ),
            ));
        }
        def.match_receive.push(mr);
    }
    Ok(())
}

fn parse_bulletin(
    def: &mut Definition,
    name: &str,
    table: &[Vec<String>],
    start: usize,
) -> SectionResult {
    if !MSG_NAME_RE.is_match(name) {
        return Err((start - 1, "invalid message name".to_owned()));
    }
    if def.bulletins.contains_key(name) {
        return Err((start - 1, format!("already have a [BULLETIN {name}] section")));
    }
    let mut area = String::new();
    let mut subject = String::new();
    let mut message = String::new();
    for (lnum, line) in table.iter().enumerate() {
        let lnum = lnum + start;
        if line.is_empty() {
            continue;
        }
        if !ascii(&line[1]) {
            return Err((lnum, format!("{:?} value is not ASCII", line[0])));
        }
        match line[0].as_str() {
            "Area" => area = line[1].clone(),
            "Subject" => subject = line[1].clone(),
            "Message" => message = line[1].clone(),
            other => return Err((lnum, format!("unknown key {other:?}"))),
        }
    }
    if area.is_empty() || subject.is_empty() || message.is_empty() {
        return Err((
            start,
            "\"Area\", \"Subject\", and \"Message\" fields are required".to_owned(),
        ));
    }
    def.bulletins.insert(
        name.to_owned(),
        BulletinDef {
            area,
            subject,
            message,
        },
    );
    Ok(())
}

fn parse_message(
    section: &str,
    name: &str,
    table: &[Vec<String>],
    start: usize,
    receive: bool,
) -> Result<MessageDef, (usize, String)> {
    if !MSG_NAME_RE.is_match(name) {
        return Err((start - 1, "invalid message name".to_owned()));
    }
    let check = if receive { ascii_or_bang } else { ascii };
    let mut mtype = String::new();
    let mut version = String::new();
    let mut fields: Vec<(String, TemplateString)> = Vec::new();
    for (lnum, line) in table.iter().enumerate() {
        let lnum = lnum + start;
        if line.is_empty() {
            continue;
        }
        match line[0].as_str() {
            "type" => {
                // `bulletin` is an alias for plain text in send templates.
                let typ = if !receive && line[1] == "bulletin" {
                    "plain"
                } else {
                    line[1].as_str()
                };
                if message::create(typ, "").is_none() {
                    return Err((lnum, format!("{:?} is not a known message type", line[1])));
                }
                mtype = typ.to_owned();
            }
            "version" => {
                if message::create(&mtype, &line[1]).is_none() {
                    return Err((
                        lnum,
                        format!("cannot create version {} of {}", line[1], mtype),
                    ));
                }
                version = line[1].clone();
            }
            fname => {
                if !ascii(fname) {
                    return Err((lnum, "field name is not ASCII".to_owned()));
                }
                if fields.iter().any(|(n, _)| n == fname) {
                    return Err((lnum, format!("multiple entries for {fname:?}")));
                }
                let tmpl = TemplateString::parse(&line[1], check)
                    .map_err(|e| (lnum, format!("{fname:?} value: {e}")))?;
                fields.push((fname.to_owned(), tmpl));
            }
        }
    }
    if mtype.is_empty() {
        return Err((start, "a value for \"type\" is required".to_owned()));
    }
    let blank = message::create(&mtype, &version).expect("type was validated above");
    for (fname, _) in &fields {
        if blank.field_by_label(fname).is_none() {
            return Err((
                start,
                format!("{mtype} messages do not have a {fname:?} field (in [{section}])"),
            ));
        }
    }
    Ok(MessageDef {
        mtype,
        version,
        fields,
    })
}

fn comma_split(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_owned)
        .collect()
}

fn verify_cross_references(def: &Definition) -> Result<(), String> {
    let mut names: HashMap<&str, &str> = HashMap::new();
    for e in &def.events {
        match e.etype {
            EventType::Receive => {
                if !def.match_receive.iter().any(|m| m.name == e.name) {
                    return Err(format!("no entry in [MATCH RECEIVE] for message {}", e.name));
                }
            }
            EventType::Inject => {
                if !def.receives.contains_key(&e.name) {
                    return Err(format!("no [RECEIVE {}] entry for inject event", e.name));
                }
            }
            EventType::Send => {
                if !def.sends.contains_key(&e.name) {
                    return Err(format!("no [SEND {}] entry for send event", e.name));
                }
            }
            _ => {}
        }
        if let Some(cond) = &e.condition {
            if !variable_exists(def, &cond.var) {
                return Err(format!(
                    "[EVENTS] {} {}: no such variable {:?}",
                    e.etype, e.name, cond.var
                ));
            }
        }
    }
    for (i, mr) in def.match_receive.iter().enumerate() {
        if !def.events.iter().any(|e| e.name == mr.name) {
            return Err(format!(
                "no receive event for message {} referenced in [MATCH RECEIVE]",
                mr.name
            ));
        }
        if let Some(earlier) = def.match_receive[..i].iter().find(|m| mr.hidden_by(m)) {
            return Err(format!(
                "[MATCH RECEIVE] for message {} is not reachable after {}",
                mr.name, earlier.name
            ));
        }
    }
    for name in def.bulletins.keys() {
        if !def
            .events
            .iter()
            .any(|e| e.name == *name && e.etype == EventType::Bulletin)
        {
            return Err(format!("no bulletin event for [BULLETIN {name}]"));
        }
        names.insert(name, "BULLETIN");
    }
    for (name, m) in &def.sends {
        if names.contains_key(name.as_str()) {
            return Err(format!("message {name} cannot be both BULLETIN and SEND"));
        }
        names.insert(name, "SEND");
        if !def
            .events
            .iter()
            .any(|e| e.name == *name && e.etype == EventType::Send)
        {
            return Err(format!("no send event for [SEND {name}]"));
        }
        check_template_variables(def, "SEND", name, m)?;
    }
    for (name, m) in &def.receives {
        if let Some(kind) = names.get(name.as_str()) {
            return Err(format!("message {name} cannot be both {kind} and RECEIVE"));
        }
        let have_inject = def
            .events
            .iter()
            .any(|e| e.name == *name && e.etype == EventType::Inject);
        let have_receive = def
            .events
            .iter()
            .any(|e| e.name == *name && e.etype == EventType::Receive);
        if !have_inject && !have_receive {
            return Err(format!("no inject or receive event for [RECEIVE {name}]"));
        }
        check_template_variables(def, "RECEIVE", name, m)?;
    }
    Ok(())
}

fn check_template_variables(
    def: &Definition,
    kind: &str,
    name: &str,
    m: &MessageDef,
) -> Result<(), String> {
    for (fname, tmpl) in &m.fields {
        for var in tmpl.variables() {
            if !variable_exists(def, var) {
                return Err(format!(
                    "[{kind} {name}] value for {fname:?} refers to nonexistent variable {var}"
                ));
            }
        }
    }
    Ok(())
}

fn variable_exists(def: &Definition, vname: &str) -> bool {
    let (group, item) = vname.split_once('.').unwrap_or((vname, ""));
    match group {
        "exercise" => def.exercise.variables.contains_key(item),
        "station" => def
            .stations
            .first()
            .is_some_and(|s| s.variables.contains_key(item)),
        "now" => matches!(item, "date" | "time" | "datetime"),
        _ => {
            (group == "UNKNOWN" || def.events.iter().any(|e| e.name == group))
                && matches!(item, "msgid" | "subjectline" | "time")
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Local, TimeZone};

    use super::super::fixtures::SAMPLE_DEF;
    use super::*;

    fn sample() -> Definition {
        parse(SAMPLE_DEF, "exercise.def").unwrap()
    }

    #[test]
    fn sample_definition_parses() {
        let def = sample();
        assert_eq!(def.exercise.my_call, "XNDEOC");
        assert_eq!(
            def.exercise.op_start,
            Some(Local.with_ymd_and_hms(2023, 9, 23, 8, 0, 0).unwrap())
        );
        assert_eq!(def.stations.len(), 2);
        assert_eq!(def.match_receive.len(), 2);
        assert!(def.bulletins.contains_key("WX_ALERT"));
        assert!(def.sends.contains_key("STATUS_REQ"));
        assert_eq!(def.receives.len(), 2);
    }

    #[test]
    fn react_defines_the_paired_event() {
        let def = sample();
        let paired = def.event(EventType::Receive, "FOO_REQ").unwrap();
        assert_eq!(paired.trigger_type, EventType::Inject);
        assert_eq!(paired.trigger_name, "FOO_REQ");
        assert_eq!(paired.delay, Duration::minutes(5));
        assert_eq!(paired.group, "Startup");
    }

    #[test]
    fn station_columns_become_variables() {
        let def = sample();
        let stn = def.station("KE6XYZ").unwrap();
        assert_eq!(stn.prefix, "6KE");
        assert_eq!(stn.variables["location"], "City Hall");
        assert_eq!(stn.variables["callsign"], "KE6XYZ");
        let abc = def.station("KE6ABC").unwrap();
        assert_eq!(abc.receipt_delay, Duration::minutes(15));
        assert!(!abc.no_receipts);
    }

    #[test]
    fn empty_trigger_defaults_to_previous_line() {
        let text = SAMPLE_DEF.replace("send STATUS_REQ   10m", "•                 10m");
        let def = parse(&text, "exercise.def").unwrap();
        let e = def.event(EventType::Receive, "STATUS_RPT").unwrap();
        // The previous line is the send STATUS_REQ event.
        assert_eq!(e.trigger_type, EventType::Send);
        assert_eq!(e.trigger_name, "STATUS_REQ");
    }

    #[test]
    fn unknown_section_is_an_error() {
        let text = format!("{SAMPLE_DEF}\n[NONSENSE]\nkey  value\n");
        let err = parse(&text, "exercise.def").unwrap_err();
        assert!(err.to_string().contains("unknown section"));
    }

    #[test]
    fn missing_exercise_section_is_fatal() {
        let err = parse("[STATIONS]\ncallsign\nKE6XYZ\n", "x.def").unwrap_err();
        assert!(err.to_string().contains("[EXERCISE] section is required"));
    }

    #[test]
    fn bulletin_triggered_by_event_is_rejected() {
        let text = SAMPLE_DEF.replace(
            "Startup  bulletin  WX_ALERT    manual",
            "Startup  bulletin  WX_ALERT    send STATUS_REQ",
        );
        let err = parse(&text, "exercise.def").unwrap_err();
        assert!(err
            .to_string()
            .contains("bulletins can only be triggered by start or manual"));
    }

    #[test]
    fn receive_without_match_rule_is_rejected() {
        let text = SAMPLE_DEF.replace("STATUS_RPT  •       •        .*status.*\n", "");
        let err = parse(&text, "exercise.def").unwrap_err();
        assert!(err.to_string().contains("no entry in [MATCH RECEIVE]"));
    }

    #[test]
    fn template_with_unknown_variable_is_rejected() {
        let text = SAMPLE_DEF.replace("«station.location»", "«station.bogus»");
        let err = parse(&text, "exercise.def").unwrap_err();
        assert!(err.to_string().contains("nonexistent variable"));
    }

    #[test]
    fn syntax_errors_carry_line_numbers() {
        let err = parse("junk before any section\n", "x.def").unwrap_err();
        assert_eq!(
            err.to_string(),
            "x.def:1: text before first [SECTION] line"
        );
    }

    #[test]
    fn pilcrow_collects_indented_text() {
        let text = SAMPLE_DEF.replace(
            "Message   Severe weather expected this afternoon.",
            "Message   ¶\n    Severe weather expected.\n    Take shelter.",
        );
        let def = parse(&text, "exercise.def").unwrap();
        assert_eq!(
            def.bulletins["WX_ALERT"].message,
            "Severe weather expected.\nTake shelter.\n"
        );
    }
}
