use crate::error::{RelayError, Result};

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ElementSpec {
    pub kind: String,
    pub props: Vec<(String, String)>,
}

impl ElementSpec {
    pub fn prop(&self, key: &str) -> Option<&str> {
        self.props
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

pub(crate) type ChainSpec = Vec<ElementSpec>;

#[derive(Debug, PartialEq, Eq)]
enum Token {
    Element(String),
    Prop(String, String),
    Link,
}

fn tokenize(descriptor: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut word = String::new();
    let mut quoted = false;
    let mut in_quotes = false;

    let flush = |word: &mut String, quoted: &mut bool, tokens: &mut Vec<Token>| -> Result<()> {
        if word.is_empty() && !*quoted {
            return Ok(());
        }
        let w = std::mem::take(word);
        *quoted = false;
        match w.split_once('=') {
            Some((key, value)) => {
                if key.is_empty() {
                    return Err(RelayError::descriptor(format!("empty property key in {:?}", w)));
                }
                tokens.push(Token::Prop(key.to_string(), value.to_string()));
            }
            None => {
                if w.contains('.') {
                    return Err(RelayError::descriptor(format!(
                        "pad reference {:?} is not supported",
                        w
                    )));
                }
                tokens.push(Token::Element(w));
            }
        }
        Ok(())
    };

    for c in descriptor.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                quoted = true;
            }
            c if in_quotes => word.push(c),
            '!' => {
                flush(&mut word, &mut quoted, &mut tokens)?;
                tokens.push(Token::Link);
            }
            c if c.is_whitespace() => flush(&mut word, &mut quoted, &mut tokens)?,
            c => word.push(c),
        }
    }
    if in_quotes {
        return Err(RelayError::descriptor("unterminated quote"));
    }
    flush(&mut word, &mut quoted, &mut tokens)?;
    Ok(tokens)
}

/// Splits a descriptor into linear chains. An element not preceded by `!`
/// starts a new chain.
pub(crate) fn parse(descriptor: &str) -> Result<Vec<ChainSpec>> {
    let mut chains = Vec::new();
    let mut current: Option<ChainSpec> = None;
    let mut pending_link = false;

    for token in tokenize(descriptor)? {
        match token {
            Token::Element(kind) => {
                let element = ElementSpec {
                    kind,
                    props: Vec::new(),
                };
                match current.as_mut() {
                    Some(chain) if pending_link => chain.push(element),
                    _ => {
                        if let Some(chain) = current.take() {
                            chains.push(chain);
                        }
                        current = Some(vec![element]);
                    }
                }
                pending_link = false;
            }
            Token::Prop(key, value) => {
                if pending_link {
                    return Err(RelayError::descriptor(format!(
                        "property {}={} follows '!'",
                        key, value
                    )));
                }
                let element = current
                    .as_mut()
                    .and_then(|chain| chain.last_mut())
                    .ok_or_else(|| {
                        RelayError::descriptor(format!("property {} before any element", key))
                    })?;
                element.props.push((key, value));
            }
            Token::Link => {
                if current.is_none() {
                    return Err(RelayError::descriptor("leading '!'"));
                }
                if pending_link {
                    return Err(RelayError::descriptor("doubled '!'"));
                }
                pending_link = true;
            }
        }
    }

    if pending_link {
        return Err(RelayError::descriptor("trailing '!'"));
    }
    if let Some(chain) = current {
        chains.push(chain);
    }
    if chains.is_empty() {
        return Err(RelayError::descriptor("empty descriptor"));
    }
    Ok(chains)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_chains_and_properties() {
        let chains = parse(
            r#"appsrc name=rtp-in is-live=true ! rtprtxreceive payload-type-map="application/x-rtp-pt-map, 96=(uint)97" ! appsink name=out
               appsrc name=rtcp-in!fakesink"#,
        )
        .unwrap();

        assert_eq!(chains.len(), 2);
        assert_eq!(chains[0].len(), 3);
        assert_eq!(chains[0][0].kind, "appsrc");
        assert_eq!(chains[0][0].prop("name"), Some("rtp-in"));
        assert_eq!(chains[0][0].prop("is-live"), Some("true"));
        assert_eq!(
            chains[0][1].prop("payload-type-map"),
            Some("application/x-rtp-pt-map, 96=(uint)97")
        );
        assert_eq!(chains[1][1].kind, "fakesink");
    }

    #[test]
    fn rejects_bad_syntax() {
        for bad in [
            "",
            "   ",
            "! appsink",
            "appsrc !",
            "appsrc ! ! appsink",
            "name=x appsrc",
            "appsrc =x",
            "appsrc ! name=x",
            "appsrc name=\"x",
            "demux. ! appsink",
        ] {
            let err = parse(bad).unwrap_err();
            assert!(
                matches!(err, RelayError::Descriptor { .. }),
                "{:?} -> {:?}",
                bad,
                err
            );
        }
    }
}
