// Workflow listing and selection.

use serde::Deserialize;

use crate::auth::SessionProvider;
use crate::error::{CatalogError, InvalidSelection};
use crate::pipeline::ProcessingApi;

/// A server-side processing pipeline the user can run images through.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Workflow {
    pub id: String,
    #[serde(rename = "name")]
    pub display_name: String,
}

/// Fetch the workflows available to the organization, in the order the API returns them.
pub fn list_workflows<A, S>(api: &A, auth: &mut S) -> Result<Vec<Workflow>, CatalogError>
where
    A: ProcessingApi + ?Sized,
    S: SessionProvider + ?Sized,
{
    let bearer = auth.bearer()?;
    api.list_workflows(&bearer)
}

/// Map a 1-based choice to the workflow id.
pub fn resolve_choice(workflows: &[Workflow], choice: i64) -> Result<&str, InvalidSelection> {
    usize::try_from(choice)
        .ok()
        .filter(|index| (1..=workflows.len()).contains(index))
        .map(|index| workflows[index - 1].id.as_str())
        .ok_or_else(|| InvalidSelection {
            choice: choice.to_string(),
            len: workflows.len(),
        })
}

/// Parse what the user typed at the prompt and resolve it.
pub fn parse_choice<'a>(
    workflows: &'a [Workflow],
    input: &str,
) -> Result<&'a str, InvalidSelection> {
    let input = input.trim();
    match input.parse::<i64>() {
        Ok(choice) => resolve_choice(workflows, choice),
        Err(_) => Err(InvalidSelection {
            choice: input.to_string(),
            len: workflows.len(),
        }),
    }
}
