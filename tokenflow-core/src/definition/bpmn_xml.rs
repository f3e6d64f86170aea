use super::{Condition, ConditionOp, EdgeSpec, GatewayDirection, NodeSpec, ProcessDefinition};
use anyhow::{anyhow, bail, Result};
use quick_xml::events::{BytesStart, Event as XmlEvent};
use quick_xml::Reader;
use std::collections::HashMap;

/// Parse a minimal BPMN 2.0 XML subset into a ProcessDefinition.
///
/// Supported elements: start/end events (terminate, error), service/script/
/// user/manual/businessRule tasks, exclusive/parallel gateways, message and
/// signal intermediate catch/throw events, callActivity, and sequenceFlow
/// with `conditionExpression` of the form `prop == literal`.
///
/// Service task types come from a nested `taskDefinition type="..."`
/// extension element; without one the node id doubles as the task type.
/// Parallel gateway direction is derived from the edge fan-in after parsing.
pub fn parse_bpmn_xml(xml: &str) -> Result<ProcessDefinition> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut parser = Parser::default();
    loop {
        match reader.read_event()? {
            XmlEvent::Start(e) => parser.handle_open(&e, false)?,
            XmlEvent::Empty(e) => parser.handle_open(&e, true)?,
            XmlEvent::End(e) => parser.handle_close(e.local_name().as_ref())?,
            XmlEvent::Text(t) => parser.handle_text(&t.unescape()?)?,
            XmlEvent::Eof => break,
            _ => {}
        }
    }
    parser.finish()
}

/// A pending container element awaiting nested detail.
enum Pending {
    End {
        id: String,
        terminate: bool,
        error_code: Option<String>,
    },
    ServiceTask {
        id: String,
        task_type: Option<String>,
    },
    ScriptTask {
        id: String,
        source: Option<String>,
        in_script: bool,
    },
    Catch {
        id: String,
        name_attr: Option<String>,
        event: Option<(EventKind, Option<String>)>,
    },
    Throw {
        id: String,
        name_attr: Option<String>,
        event: Option<(EventKind, Option<String>)>,
    },
    SequenceFlow {
        id: Option<String>,
        from: String,
        to: String,
        condition: Option<String>,
        in_condition: bool,
    },
}

#[derive(Clone, Copy, PartialEq)]
enum EventKind {
    Message,
    Signal,
}

#[derive(Default)]
struct Parser {
    process_id: Option<String>,
    in_process: bool,
    nodes: Vec<NodeSpec>,
    edges: Vec<EdgeSpec>,
    /// sequenceFlow id → edge index, for resolving gateway `default` attrs.
    flow_ids: HashMap<String, usize>,
    /// gateway id → default flow id.
    gateway_defaults: HashMap<String, String>,
    pending: Option<Pending>,
}

fn attr(e: &BytesStart<'_>, name: &[u8]) -> Result<Option<String>> {
    for a in e.attributes() {
        let a = a?;
        if a.key.local_name().as_ref() == name {
            return Ok(Some(a.unescape_value()?.into_owned()));
        }
    }
    Ok(None)
}

fn required_attr(e: &BytesStart<'_>, name: &[u8], element: &str) -> Result<String> {
    attr(e, name)?.ok_or_else(|| {
        anyhow!(
            "<{element}> missing required attribute '{}'",
            String::from_utf8_lossy(name)
        )
    })
}

impl Parser {
    fn handle_open(&mut self, e: &BytesStart<'_>, empty: bool) -> Result<()> {
        let local = e.local_name();
        let local = local.as_ref();

        if local == b"process" {
            if self.process_id.is_none() {
                self.process_id = Some(required_attr(e, b"id", "process")?);
                self.in_process = true;
            }
            return Ok(());
        }
        if !self.in_process {
            return Ok(());
        }

        // Nested detail inside a pending container
        if self.pending.is_some() {
            self.handle_nested(e, local)?;
            if empty {
                return Ok(());
            }
            // Non-empty nested containers (script, conditionExpression) are
            // closed by handle_close via their flags.
            return Ok(());
        }

        match local {
            b"startEvent" => {
                let id = required_attr(e, b"id", "startEvent")?;
                self.nodes.push(NodeSpec::Start { id });
            }
            b"endEvent" => {
                let id = required_attr(e, b"id", "endEvent")?;
                if empty {
                    self.nodes.push(NodeSpec::End { id, terminate: false });
                } else {
                    self.pending = Some(Pending::End {
                        id,
                        terminate: false,
                        error_code: None,
                    });
                }
            }
            b"serviceTask" => {
                let id = required_attr(e, b"id", "serviceTask")?;
                if empty {
                    self.push_service(id, None);
                } else {
                    self.pending = Some(Pending::ServiceTask { id, task_type: None });
                }
            }
            b"scriptTask" => {
                let id = required_attr(e, b"id", "scriptTask")?;
                if empty {
                    bail!("<scriptTask id=\"{id}\"> has no <script> body");
                }
                self.pending = Some(Pending::ScriptTask {
                    id,
                    source: None,
                    in_script: false,
                });
            }
            b"businessRuleTask" => {
                let id = required_attr(e, b"id", "businessRuleTask")?;
                let decision = attr(e, b"decisionRef")?.unwrap_or_else(|| id.clone());
                self.nodes.push(NodeSpec::BusinessRuleTask {
                    id,
                    decision,
                    error_code: None,
                });
            }
            b"userTask" => {
                let id = required_attr(e, b"id", "userTask")?;
                let assignee = attr(e, b"assignee")?;
                self.nodes.push(NodeSpec::UserTask { id, assignee });
            }
            b"manualTask" => {
                let id = required_attr(e, b"id", "manualTask")?;
                self.nodes.push(NodeSpec::ManualTask { id });
            }
            b"exclusiveGateway" => {
                let id = required_attr(e, b"id", "exclusiveGateway")?;
                if let Some(default_flow) = attr(e, b"default")? {
                    self.gateway_defaults.insert(id.clone(), default_flow);
                }
                self.nodes.push(NodeSpec::ExclusiveGateway { id });
            }
            b"parallelGateway" => {
                let id = required_attr(e, b"id", "parallelGateway")?;
                // Direction fixed up from edge fan-in in finish()
                self.nodes.push(NodeSpec::ParallelGateway {
                    id,
                    direction: GatewayDirection::Diverging,
                });
            }
            b"intermediateCatchEvent" => {
                let id = required_attr(e, b"id", "intermediateCatchEvent")?;
                self.pending = Some(Pending::Catch {
                    id,
                    name_attr: attr(e, b"name")?,
                    event: None,
                });
            }
            b"intermediateThrowEvent" => {
                let id = required_attr(e, b"id", "intermediateThrowEvent")?;
                self.pending = Some(Pending::Throw {
                    id,
                    name_attr: attr(e, b"name")?,
                    event: None,
                });
            }
            b"callActivity" => {
                let id = required_attr(e, b"id", "callActivity")?;
                let process_id = required_attr(e, b"calledElement", "callActivity")?;
                self.nodes.push(NodeSpec::CallActivity {
                    id,
                    process_id,
                    group: None,
                });
            }
            b"sequenceFlow" => {
                let flow = Pending::SequenceFlow {
                    id: attr(e, b"id")?,
                    from: required_attr(e, b"sourceRef", "sequenceFlow")?,
                    to: required_attr(e, b"targetRef", "sequenceFlow")?,
                    condition: None,
                    in_condition: false,
                };
                if empty {
                    self.pending = Some(flow);
                    self.close_pending()?;
                } else {
                    self.pending = Some(flow);
                }
            }
            // Diagram interchange and anything else: skipped
            _ => {}
        }
        Ok(())
    }

    fn handle_nested(&mut self, e: &BytesStart<'_>, local: &[u8]) -> Result<()> {
        match self.pending.as_mut() {
            Some(Pending::End { terminate, error_code, .. }) => match local {
                b"terminateEventDefinition" => *terminate = true,
                b"errorEventDefinition" => {
                    *error_code = Some(attr(e, b"errorRef")?.unwrap_or_else(|| "ERROR".to_string()));
                }
                _ => {}
            },
            Some(Pending::ServiceTask { task_type, .. }) => {
                if local == b"taskDefinition" {
                    *task_type = attr(e, b"type")?;
                }
            }
            Some(Pending::ScriptTask { in_script, .. }) => {
                if local == b"script" {
                    *in_script = true;
                }
            }
            Some(Pending::Catch { event, .. }) | Some(Pending::Throw { event, .. }) => {
                match local {
                    b"messageEventDefinition" => {
                        *event = Some((EventKind::Message, attr(e, b"messageRef")?));
                    }
                    b"signalEventDefinition" => {
                        *event = Some((EventKind::Signal, attr(e, b"signalRef")?));
                    }
                    _ => {}
                }
            }
            Some(Pending::SequenceFlow { in_condition, .. }) => {
                if local == b"conditionExpression" {
                    *in_condition = true;
                }
            }
            None => {}
        }
        Ok(())
    }

    fn handle_text(&mut self, text: &str) -> Result<()> {
        match self.pending.as_mut() {
            Some(Pending::ScriptTask {
                source,
                in_script: true,
                ..
            }) => {
                *source = Some(text.to_string());
            }
            Some(Pending::SequenceFlow {
                condition,
                in_condition: true,
                ..
            }) => {
                *condition = Some(text.to_string());
            }
            _ => {}
        }
        Ok(())
    }

    fn handle_close(&mut self, local: &[u8]) -> Result<()> {
        match local {
            b"process" => self.in_process = false,
            b"script" => {
                if let Some(Pending::ScriptTask { in_script, .. }) = self.pending.as_mut() {
                    *in_script = false;
                }
            }
            b"conditionExpression" => {
                if let Some(Pending::SequenceFlow { in_condition, .. }) = self.pending.as_mut() {
                    *in_condition = false;
                }
            }
            b"endEvent" | b"serviceTask" | b"scriptTask" | b"intermediateCatchEvent"
            | b"intermediateThrowEvent" | b"sequenceFlow" => self.close_pending()?,
            _ => {}
        }
        Ok(())
    }

    fn close_pending(&mut self) -> Result<()> {
        let Some(pending) = self.pending.take() else {
            return Ok(());
        };
        match pending {
            Pending::End {
                id,
                terminate,
                error_code,
            } => {
                if let Some(code) = error_code {
                    self.nodes.push(NodeSpec::ErrorEnd { id, code });
                } else {
                    self.nodes.push(NodeSpec::End { id, terminate });
                }
            }
            Pending::ServiceTask { id, task_type } => self.push_service(id, task_type),
            Pending::ScriptTask { id, source, .. } => {
                let source =
                    source.ok_or_else(|| anyhow!("<scriptTask id=\"{id}\"> has no <script> body"))?;
                self.nodes.push(NodeSpec::ScriptTask {
                    id,
                    source,
                    error_code: None,
                });
            }
            Pending::Catch {
                id,
                name_attr,
                event,
            } => {
                let (kind, ref_name) =
                    event.ok_or_else(|| anyhow!("catch event '{id}' has no event definition"))?;
                let name = ref_name.or(name_attr).unwrap_or_else(|| id.clone());
                self.nodes.push(match kind {
                    EventKind::Message => NodeSpec::MessageCatch { id, message: name },
                    EventKind::Signal => NodeSpec::SignalCatch { id, signal: name },
                });
            }
            Pending::Throw {
                id,
                name_attr,
                event,
            } => {
                let (kind, ref_name) =
                    event.ok_or_else(|| anyhow!("throw event '{id}' has no event definition"))?;
                let name = ref_name.or(name_attr).unwrap_or_else(|| id.clone());
                self.nodes.push(match kind {
                    EventKind::Message => NodeSpec::MessageThrow { id, message: name },
                    EventKind::Signal => NodeSpec::SignalThrow { id, signal: name },
                });
            }
            Pending::SequenceFlow {
                id,
                from,
                to,
                condition,
                ..
            } => {
                let condition = condition.as_deref().map(parse_condition_expr).transpose()?;
                let index = self.edges.len();
                self.edges.push(EdgeSpec {
                    from,
                    to,
                    condition,
                    is_default: false,
                });
                if let Some(flow_id) = id {
                    self.flow_ids.insert(flow_id, index);
                }
            }
        }
        Ok(())
    }

    fn push_service(&mut self, id: String, task_type: Option<String>) {
        let task_type = task_type.unwrap_or_else(|| id.clone());
        self.nodes.push(NodeSpec::ServiceTask {
            id,
            task_type,
            error_code: None,
        });
    }

    fn finish(mut self) -> Result<ProcessDefinition> {
        let id = self
            .process_id
            .ok_or_else(|| anyhow!("no <process> element found"))?;

        // Gateway default attributes → is_default on the referenced flow
        for flow_id in self.gateway_defaults.values() {
            if let Some(&index) = self.flow_ids.get(flow_id) {
                self.edges[index].is_default = true;
            }
        }

        // Parallel gateway direction from fan-in
        let mut incoming: HashMap<&str, usize> = HashMap::new();
        for edge in &self.edges {
            *incoming.entry(edge.to.as_str()).or_insert(0) += 1;
        }
        let converging: Vec<String> = self
            .nodes
            .iter()
            .filter_map(|n| match n {
                NodeSpec::ParallelGateway { id, .. }
                    if incoming.get(id.as_str()).copied().unwrap_or(0) > 1 =>
                {
                    Some(id.clone())
                }
                _ => None,
            })
            .collect();
        for node in &mut self.nodes {
            if let NodeSpec::ParallelGateway { id, direction } = node {
                if converging.contains(id) {
                    *direction = GatewayDirection::Converging;
                }
            }
        }

        Ok(ProcessDefinition {
            id,
            meta: None,
            nodes: self.nodes,
            edges: self.edges,
        })
    }
}

/// Parse `prop == literal` (also `!=`, `<`, `>`). Literals are JSON; bare
/// words fall back to strings.
fn parse_condition_expr(expr: &str) -> Result<Condition> {
    // Checked before the single-character scan so `a <= 1` fails instead of
    // half-parsing as `<` with operand `= 1`
    for token in ["<=", ">="] {
        if expr.contains(token) {
            bail!("unsupported condition operator '{token}': '{expr}'");
        }
    }
    for (token, op) in [
        ("==", ConditionOp::Eq),
        ("!=", ConditionOp::Neq),
        ("<", ConditionOp::Lt),
        (">", ConditionOp::Gt),
    ] {
        if let Some((lhs, rhs)) = expr.split_once(token) {
            let property = lhs.trim().to_string();
            let rhs = rhs.trim();
            if property.is_empty() || rhs.is_empty() {
                break;
            }
            let value = serde_json::from_str(rhs)
                .unwrap_or_else(|_| serde_json::Value::String(rhs.trim_matches('"').to_string()));
            return Ok(Condition { property, op, value });
        }
    }
    bail!("unsupported condition expression: '{expr}'")
}
