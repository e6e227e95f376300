//! Declarative page interactions
//!
//! Every action carries its own settle delay and validates its required field
//! before anything touches a browser.

use crate::job::OutputRoute;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// Script used to scroll the page by a vertical offset
pub(crate) const SCROLL_SCRIPT: &str = r#"(scrollY) => {
    window.scrollBy({ top: scrollY, behavior: 'smooth' });
}"#;

/// Errors raised when an action is malformed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActionError {
    #[error("{kind} action requires a selector")]
    EmptySelector { kind: &'static str },

    #[error("scroll action requires a non-zero offset")]
    ZeroScroll,

    #[error("evaluate action requires a script")]
    EmptyScript,
}

/// A single scripted page interaction
#[derive(Debug, Clone)]
pub enum Action {
    /// Click the first element matching a CSS selector
    Click { selector: String, delay: Duration },

    /// Click the first element matching an XPath expression
    ClickXPath { selector: String, delay: Duration },

    /// Scroll the page vertically by `delta_y` pixels
    Scroll { delta_y: i64, delay: Duration },

    /// Evaluate a script with arguments; the JSON result is optionally
    /// published on `capture` as a payload
    EvaluateScript {
        script: String,
        args: Vec<Value>,
        capture: Option<OutputRoute>,
        delay: Duration,
    },
}

impl Action {
    pub fn click(selector: impl Into<String>, delay: Duration) -> Self {
        Self::Click {
            selector: selector.into(),
            delay,
        }
    }

    pub fn click_xpath(selector: impl Into<String>, delay: Duration) -> Self {
        Self::ClickXPath {
            selector: selector.into(),
            delay,
        }
    }

    pub fn scroll(delta_y: i64, delay: Duration) -> Self {
        Self::Scroll { delta_y, delay }
    }

    pub fn evaluate(script: impl Into<String>, args: Vec<Value>, delay: Duration) -> Self {
        Self::EvaluateScript {
            script: script.into(),
            args,
            capture: None,
            delay,
        }
    }

    /// Routes the result of an `EvaluateScript` action to `route`
    ///
    /// Has no effect on other variants.
    pub fn capture_into(mut self, route: OutputRoute) -> Self {
        if let Self::EvaluateScript { capture, .. } = &mut self {
            *capture = Some(route);
        }
        self
    }

    /// Checks that the variant's required field is present
    pub fn validate(&self) -> Result<(), ActionError> {
        match self {
            Self::Click { selector, .. } if selector.trim().is_empty() => {
                Err(ActionError::EmptySelector { kind: self.kind() })
            }
            Self::ClickXPath { selector, .. } if selector.trim().is_empty() => {
                Err(ActionError::EmptySelector { kind: self.kind() })
            }
            Self::Scroll { delta_y: 0, .. } => Err(ActionError::ZeroScroll),
            Self::EvaluateScript { script, .. } if script.trim().is_empty() => {
                Err(ActionError::EmptyScript)
            }
            _ => Ok(()),
        }
    }

    /// The post-action settle delay
    pub fn delay(&self) -> Duration {
        match self {
            Self::Click { delay, .. }
            | Self::ClickXPath { delay, .. }
            | Self::Scroll { delay, .. }
            | Self::EvaluateScript { delay, .. } => *delay,
        }
    }

    /// Short name used in logs and errors
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Click { .. } => "click",
            Self::ClickXPath { .. } => "click-xpath",
            Self::Scroll { .. } => "scroll",
            Self::EvaluateScript { .. } => "evaluate",
        }
    }

    /// The output route a script result is published on, if any
    pub fn capture(&self) -> Option<&OutputRoute> {
        match self {
            Self::EvaluateScript { capture, .. } => capture.as_ref(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const NO_DELAY: Duration = Duration::ZERO;

    #[test]
    fn test_valid_actions() {
        assert!(Action::click("#next", NO_DELAY).validate().is_ok());
        assert!(Action::click_xpath("//button[1]", NO_DELAY)
            .validate()
            .is_ok());
        assert!(Action::scroll(-400, NO_DELAY).validate().is_ok());
        assert!(Action::evaluate("() => document.title", vec![], NO_DELAY)
            .validate()
            .is_ok());
    }

    #[test]
    fn test_empty_selector_rejected() {
        assert_eq!(
            Action::click("", NO_DELAY).validate(),
            Err(ActionError::EmptySelector { kind: "click" })
        );
        assert_eq!(
            Action::click_xpath("   ", NO_DELAY).validate(),
            Err(ActionError::EmptySelector {
                kind: "click-xpath"
            })
        );
    }

    #[test]
    fn test_zero_scroll_rejected() {
        assert_eq!(
            Action::scroll(0, NO_DELAY).validate(),
            Err(ActionError::ZeroScroll)
        );
    }

    #[test]
    fn test_empty_script_rejected() {
        assert_eq!(
            Action::evaluate("", vec![json!(1)], NO_DELAY).validate(),
            Err(ActionError::EmptyScript)
        );
    }

    #[test]
    fn test_delay_is_per_variant() {
        let delay = Duration::from_millis(250);
        assert_eq!(Action::click("a", delay).delay(), delay);
        assert_eq!(Action::scroll(10, delay).delay(), delay);
    }

    #[test]
    fn test_capture_only_applies_to_scripts() {
        let route = OutputRoute::observe("dom");

        let script = Action::evaluate("() => 1", vec![], NO_DELAY).capture_into(route.clone());
        assert_eq!(script.capture().map(|r| r.name.as_str()), Some("dom"));

        let click = Action::click("a", NO_DELAY).capture_into(route);
        assert!(click.capture().is_none());
    }
}
